//! Client registry: maps client identities to notification callback addresses.
//!
//! Registration rules:
//! - Unknown client: a new registration with a fresh handle is created
//! - Known client, same address: the existing handle is returned unchanged
//! - Known client, different address: `Conflict`, existing registration untouched
//! - Unknown client on an address held by another client: the stale
//!   registration is replaced, since an address belongs to one live client
//!
//! Unregistering an unknown handle is a no-op that only logs a diagnostic.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rmb_id::{ClientId, Handle};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, BrokerResult};

/// Host and port a client listens on for notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackAddress {
    host: String,
    port: u16,
}

impl CallbackAddress {
    /// Validates and normalizes an address. Hosts compare case-insensitively.
    pub fn new(host: &str, port: i64) -> BrokerResult<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(BrokerError::validation("callback host cannot be empty"));
        }
        if host.len() > 255 || host.chars().any(char::is_whitespace) {
            return Err(BrokerError::validation(format!(
                "invalid callback host '{}'",
                host
            )));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| BrokerError::validation(format!("invalid callback port {}", port)))?;

        Ok(Self {
            host: host.to_lowercase(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for CallbackAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A live registration, keyed by its handle.
#[derive(Debug, Clone)]
struct ClientRegistration {
    client_id: ClientId,
    address: CallbackAddress,
    registered_at: DateTime<Utc>,
}

/// Result of a successful `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub handle: Handle,
    /// True if this call created the registration.
    pub created: bool,
    /// Handle of a stale registration that held the same address, now removed.
    pub replaced: Option<Handle>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_handle: HashMap<Handle, ClientRegistration>,
    by_client: HashMap<ClientId, Handle>,
    by_address: HashMap<CallbackAddress, Handle>,
}

impl RegistryInner {
    fn remove(&mut self, handle: &Handle) -> Option<ClientRegistration> {
        let registration = self.by_handle.remove(handle)?;
        self.by_client.remove(&registration.client_id);
        self.by_address.remove(&registration.address);
        Some(registration)
    }

    fn fresh_handle(&self) -> Handle {
        loop {
            let handle = Handle::new();
            if !self.by_handle.contains_key(&handle) {
                return handle;
            }
        }
    }
}

/// Registry of clients awaiting allocation notifications.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client_id` at `address`, see the module docs for the rules.
    pub async fn register(
        &self,
        client_id: ClientId,
        address: CallbackAddress,
    ) -> BrokerResult<RegisterOutcome> {
        let mut inner = self.inner.write().await;

        if let Some(handle) = inner.by_client.get(&client_id).copied() {
            let existing = &inner.by_handle[&handle];
            if existing.address == address {
                debug!(client_id = %client_id, handle = %handle, "Client re-registered");
                return Ok(RegisterOutcome {
                    handle,
                    created: false,
                    replaced: None,
                });
            }
            return Err(BrokerError::Conflict {
                client_id,
                existing: existing.address.clone(),
            });
        }

        let replaced = match inner.by_address.get(&address).copied() {
            Some(stale) => {
                if let Some(old) = inner.remove(&stale) {
                    warn!(
                        client_id = %client_id,
                        stale_client_id = %old.client_id,
                        stale_handle = %stale,
                        address = %address,
                        "Callback address taken over from stale registration"
                    );
                }
                Some(stale)
            }
            None => None,
        };

        let handle = inner.fresh_handle();
        inner.by_client.insert(client_id, handle);
        inner.by_address.insert(address.clone(), handle);
        inner.by_handle.insert(
            handle,
            ClientRegistration {
                client_id,
                address: address.clone(),
                registered_at: Utc::now(),
            },
        );

        info!(client_id = %client_id, handle = %handle, address = %address, "Client registered");

        Ok(RegisterOutcome {
            handle,
            created: true,
            replaced,
        })
    }

    /// Removes the registration for `handle`. Returns whether one existed.
    pub async fn unregister(&self, handle: Handle) -> bool {
        let mut inner = self.inner.write().await;
        match inner.remove(&handle) {
            Some(registration) => {
                info!(
                    client_id = %registration.client_id,
                    handle = %handle,
                    registered_secs = (Utc::now() - registration.registered_at).num_seconds(),
                    "Client unregistered"
                );
                true
            }
            None => {
                warn!(handle = %handle, "Unregister for unknown handle ignored");
                false
            }
        }
    }

    /// Resolves a handle to its client and callback address.
    pub async fn resolve(&self, handle: Handle) -> Option<(ClientId, CallbackAddress)> {
        let inner = self.inner.read().await;
        inner
            .by_handle
            .get(&handle)
            .map(|r| (r.client_id, r.address.clone()))
    }

    /// Fails with `UnknownHandle` unless `handle` is registered.
    pub async fn validate_handle(&self, handle: Handle) -> BrokerResult<()> {
        let inner = self.inner.read().await;
        if inner.by_handle.contains_key(&handle) {
            Ok(())
        } else {
            Err(BrokerError::UnknownHandle(handle))
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_handle.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
