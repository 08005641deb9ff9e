//! In-process realtime database
//!
//! Holds the whole store as one JSON document and notifies listeners on
//! every write. Writes are applied and fanned out under a single lock, so a
//! write of a record is observed atomically.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{tree, validate_path, ChannelUpdate, RemoteChannel, Subscription};
use crate::errors::FloodScoutError;
use crate::models::paths;

struct Listener {
    id: u64,
    path: String,
    tx: mpsc::UnboundedSender<ChannelUpdate>,
}

struct Inner {
    root: Value,
    listeners: Vec<Listener>,
    next_id: u64,
    connected: bool,
    writes: Vec<ChannelUpdate>,
}

#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::with_root(Value::Null)
    }

    /// Start from an existing document
    pub fn with_root(root: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                root,
                listeners: Vec::new(),
                next_id: 0,
                connected: true,
                writes: Vec::new(),
            })),
        }
    }

    /// Simulate loss or recovery of connectivity
    pub fn set_connected(&self, connected: bool) {
        lock(&self.inner).connected = connected;
    }

    /// Every successful write, in order
    pub fn writes(&self) -> Vec<ChannelUpdate> {
        lock(&self.inner).writes.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.inner).writes.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    /// Current value at `path`, bypassing connectivity
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        tree::get(&lock(&self.inner).root, path)
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn ensure_connected(inner: &Inner) -> Result<(), FloodScoutError> {
        if inner.connected {
            Ok(())
        } else {
            Err(FloodScoutError::ChannelClosed)
        }
    }
}

#[async_trait]
impl RemoteChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    async fn publish(&self, path: &str, value: Value) -> Result<(), FloodScoutError> {
        validate_path(path)?;
        let mut inner = lock(&self.inner);
        Self::ensure_connected(&inner)?;

        tree::set(&mut inner.root, path, value.clone());
        inner.writes.push(ChannelUpdate::new(path, value.clone()));

        let Inner {
            root, listeners, ..
        } = &mut *inner;
        listeners.retain(|listener| {
            let update = if paths::relative(&listener.path, path).is_some() {
                ChannelUpdate::new(path, value.clone())
            } else if paths::relative(path, &listener.path).is_some() {
                let subtree = tree::get(root, &listener.path).cloned();
                ChannelUpdate::new(listener.path.clone(), subtree.unwrap_or(Value::Null))
            } else {
                return true;
            };
            listener.tx.send(update).is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, FloodScoutError> {
        validate_path(path)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut inner = lock(&self.inner);
            Self::ensure_connected(&inner)?;
            let id = inner.next_id;
            inner.next_id += 1;
            if let Some(current) = tree::get(&inner.root, path).filter(|v| !v.is_null()) {
                let _ = tx.send(ChannelUpdate::new(path, current.clone()));
            }
            inner.listeners.push(Listener {
                id,
                path: path.to_string(),
                tx,
            });
            id
        };
        debug!(path, id, "Listener attached");

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(path, rx, move || {
            if let Some(inner) = inner.upgrade() {
                lock(&inner).listeners.retain(|listener| listener.id != id);
            }
        }))
    }

    async fn read_once(&self, path: &str) -> Result<Option<Value>, FloodScoutError> {
        validate_path(path)?;
        let inner = lock(&self.inner);
        Self::ensure_connected(&inner)?;
        let value = tree::get(&inner.root, path)
            .filter(|v| !v.is_null())
            .cloned();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscription_receives_current_value_then_writes() {
        let channel = MemoryChannel::with_root(json!({ "boatState": { "power": true } }));
        let mut subscription = channel.subscribe("boatState").await.unwrap();

        assert_eq!(
            subscription.try_recv(),
            Some(ChannelUpdate::new("boatState", json!({ "power": true })))
        );

        channel.publish("boatState/speed", json!(30)).await.unwrap();
        channel.publish("history/userLocations/1", json!({})).await.unwrap();

        assert_eq!(
            subscription.try_recv(),
            Some(ChannelUpdate::new("boatState/speed", json!(30)))
        );
        assert_eq!(subscription.try_recv(), None);
    }

    #[tokio::test]
    async fn ancestor_write_delivers_subtree() {
        let channel = MemoryChannel::new();
        let mut subscription = channel.subscribe("boatState/video/stream").await.unwrap();
        assert_eq!(subscription.try_recv(), None);

        channel
            .publish("boatState", json!({ "power": false, "video": { "stream": null } }))
            .await
            .unwrap();

        assert_eq!(
            subscription.try_recv(),
            Some(ChannelUpdate::new("boatState/video/stream", Value::Null))
        );
    }

    #[tokio::test]
    async fn dropping_subscription_detaches_listener() {
        let channel = MemoryChannel::new();
        let first = channel.subscribe("boatState").await.unwrap();
        let second = channel.subscribe("history/userLocations").await.unwrap();
        assert_eq!(channel.listener_count(), 2);

        drop(first);
        assert_eq!(channel.listener_count(), 1);
        drop(second);
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn read_once_returns_stored_value() {
        let channel = MemoryChannel::new();
        assert_eq!(channel.read_once("boatState/location").await.unwrap(), None);

        let location = json!({ "latitude": 23.8, "longitude": 90.4 });
        channel
            .publish("boatState/location", location.clone())
            .await
            .unwrap();

        assert_eq!(
            channel.read_once("boatState/location").await.unwrap(),
            Some(location)
        );
        assert_eq!(channel.write_count(), 1);
    }

    #[tokio::test]
    async fn disconnected_channel_rejects_operations() {
        let channel = MemoryChannel::new();
        channel.set_connected(false);

        assert!(!channel.is_connected());
        assert!(channel.publish("boatState/power", json!(true)).await.is_err());
        assert!(channel.read_once("boatState").await.is_err());
        assert!(channel.subscribe("boatState").await.is_err());
        assert_eq!(channel.write_count(), 0);
    }

    #[tokio::test]
    async fn invalid_paths_are_rejected() {
        let channel = MemoryChannel::new();
        assert!(matches!(
            channel.publish("boatState/#", json!(1)).await,
            Err(FloodScoutError::InvalidPath(_))
        ));
    }
}
