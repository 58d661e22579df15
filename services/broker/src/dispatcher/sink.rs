//! Delivery adapters for notification batches.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rmb_events::{AllocationEvent, Notification};
use rmb_id::Handle;
use thiserror::Error;
use tracing::debug;

use crate::registry::CallbackAddress;

/// Why a delivery attempt failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("callback rejected notification with status {status}")]
    Rejected { status: u16 },
}

/// Pushes a notification batch to a client's callback address.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        address: &CallbackAddress,
        notification: &Notification,
    ) -> Result<(), DeliveryError>;
}

/// Delivers notifications as JSON `POST`s to `http://{host}:{port}{path}`.
pub struct HttpNotificationSink {
    client: reqwest::Client,
    path: String,
}

impl HttpNotificationSink {
    pub const DEFAULT_PATH: &'static str = "/notifications";

    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            path: Self::DEFAULT_PATH.to_string(),
        })
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    fn url(&self, address: &CallbackAddress) -> String {
        format!("http://{}:{}{}", address.host(), address.port(), self.path)
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn deliver(
        &self,
        address: &CallbackAddress,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        let url = self.url(address);
        debug!(url = %url, events = notification.events.len(), "Posting notification");

        let response = self
            .client
            .post(&url)
            .json(notification)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// In-memory sink that records deliveries. Can be told to fail a number of
/// attempts first.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(CallbackAddress, Notification)>>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose first `failures` attempts fail with a transport error.
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    /// Delivery attempts, successful or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<(CallbackAddress, Notification)> {
        match self.delivered.lock() {
            Ok(delivered) => delivered.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Every delivered event, in delivery order.
    pub fn events(&self) -> Vec<AllocationEvent> {
        self.delivered()
            .into_iter()
            .flat_map(|(_, n)| n.events)
            .collect()
    }

    /// Delivered events addressed to `handle`.
    pub fn events_for(&self, handle: Handle) -> Vec<AllocationEvent> {
        self.delivered()
            .into_iter()
            .filter(|(_, n)| n.handle == handle)
            .flat_map(|(_, n)| n.events)
            .collect()
    }

    /// Polls until at least `count` events were delivered or `timeout` passes.
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> Vec<AllocationEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(
        &self,
        address: &CallbackAddress,
        notification: &Notification,
    ) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeliveryError::Transport("connection refused".to_string()));
        }

        let mut delivered = match self.delivered.lock() {
            Ok(delivered) => delivered,
            Err(poisoned) => poisoned.into_inner(),
        };
        delivered.push((address.clone(), notification.clone()));
        Ok(())
    }
}
