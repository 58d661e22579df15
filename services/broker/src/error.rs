//! Broker error type and its mapping onto RPC status codes.

use rmb_events::EventError;
use rmb_id::{ClientId, Handle};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connector::BackendError;
use crate::registry::CallbackAddress;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Status codes carried in every RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    RequestError,
    InternalError,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::RequestError => write!(f, "REQUEST_ERROR"),
            StatusCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// Errors surfaced by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed input (address, version, id).
    #[error("validation error: {0}")]
    Validation(String),

    /// Malformed resource request.
    #[error(transparent)]
    InvalidRequest(#[from] EventError),

    /// The client is registered with a different callback address.
    #[error("client {client_id} already registered with callback {existing}")]
    Conflict {
        client_id: ClientId,
        existing: CallbackAddress,
    },

    /// The handle does not belong to a live registration.
    #[error("unknown handle {0}")]
    UnknownHandle(Handle),

    /// The request names a protocol version this broker does not speak.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    /// Operation requires a registered queue.
    #[error("connector is not registered to a queue")]
    NotRegistered,

    /// The external resource manager could not be reached.
    #[error("resource manager unavailable")]
    ResourceManagerUnavailable(#[source] BackendError),

    /// `start` was called before a listener was installed.
    #[error("allocation listener not set")]
    ListenerNotSet,

    /// Operation called before `start` or after `stop`.
    #[error("connector is not running")]
    NotStarted,
}

impl BrokerError {
    pub fn validation(message: impl Into<String>) -> Self {
        BrokerError::Validation(message.into())
    }

    /// Maps the error onto the RPC status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::Validation(_)
            | BrokerError::InvalidRequest(_)
            | BrokerError::Conflict { .. }
            | BrokerError::UnknownHandle(_)
            | BrokerError::UnsupportedVersion(_)
            | BrokerError::NotRegistered => StatusCode::RequestError,
            BrokerError::ResourceManagerUnavailable(_)
            | BrokerError::ListenerNotSet
            | BrokerError::NotStarted => StatusCode::InternalError,
        }
    }
}

impl From<BackendError> for BrokerError {
    fn from(err: BackendError) -> Self {
        BrokerError::ResourceManagerUnavailable(err)
    }
}
