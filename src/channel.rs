//! Remote state channel
//!
//! The dashboard never owns boat or history state; it reaches the remote
//! store through a [`RemoteChannel`]. Two realizations are provided: an
//! event transport over MQTT with retained messages ([`MqttChannel`]) and an
//! in-process realtime database ([`MemoryChannel`]).

mod memory;
mod mqtt;
pub mod tree;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::FloodScoutError;

pub use memory::MemoryChannel;
pub use mqtt::{MqttChannel, MqttChannelBuilder};

/// A value pushed by the channel for a subscribed path
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    /// Full logical path of the written value
    pub path: String,
    pub value: Value,
}

impl ChannelUpdate {
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Detaches a subscription from its channel when dropped
pub struct SubscriptionGuard {
    unsubscribe: Option<Unsubscribe>,
}

impl SubscriptionGuard {
    fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Live subscription on a path. Dropping it unsubscribes.
pub struct Subscription {
    path: String,
    rx: mpsc::UnboundedReceiver<ChannelUpdate>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(
        path: impl Into<String>,
        rx: mpsc::UnboundedReceiver<ChannelUpdate>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            rx,
            guard: SubscriptionGuard::new(unsubscribe),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next update, `None` once the channel side has gone away
    pub async fn recv(&mut self) -> Option<ChannelUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelUpdate> {
        self.rx.try_recv().ok()
    }

    /// Split into the update stream and the guard that keeps it attached
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ChannelUpdate>, SubscriptionGuard) {
        (self.rx, self.guard)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Push-capable transport to the remote state store.
///
/// A subscription on `P` receives writes at `P` or beneath it; the current
/// value at `P`, if any, is delivered first.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Identifier of the realization (e.g. "mqtt", "memory")
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Write `value` at `path`, replacing whatever was there.
    async fn publish(&self, path: &str, value: Value) -> Result<(), FloodScoutError>;

    async fn subscribe(&self, path: &str) -> Result<Subscription, FloodScoutError>;

    /// One-shot read. `None` when nothing is stored at `path`.
    async fn read_once(&self, path: &str) -> Result<Option<Value>, FloodScoutError>;
}

/// Check that `path` is a plain slash-separated logical path
pub fn validate_path(path: &str) -> Result<(), FloodScoutError> {
    let valid = !path.is_empty()
        && path.split('/').all(|segment| {
            !segment.is_empty() && !segment.contains(|c| c == '+' || c == '#')
        });
    if valid {
        Ok(())
    } else {
        Err(FloodScoutError::InvalidPath(path.to_string()))
    }
}
