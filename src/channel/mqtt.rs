//! MQTT channel implementation
//!
//! Each logical path maps to the topic `{prefix}/{path}`. Writes are
//! published retained, so the broker holds the latest value of every leaf
//! and a fresh subscription replays it. Writing a whole record first clears
//! the retained leaves this client wrote beneath it, so a replay cannot
//! resurrect them over the record.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{tree, validate_path, ChannelUpdate, RemoteChannel, Subscription};
use crate::{
    config::{MqttConfig, MqttTransport},
    errors::FloodScoutError,
    models::paths,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Subscriber {
    id: u64,
    path: String,
    tx: mpsc::UnboundedSender<ChannelUpdate>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

impl Registry {
    fn add(&mut self, path: &str, tx: mpsc::UnboundedSender<ChannelUpdate>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            path: path.to_string(),
            tx,
        });
        id
    }

    /// Remove a subscriber, returning whether its path is now unwatched
    fn remove(&mut self, id: u64) -> bool {
        let Some(index) = self.subscribers.iter().position(|s| s.id == id) else {
            return false;
        };
        let removed = self.subscribers.swap_remove(index);
        !self.subscribers.iter().any(|s| s.path == removed.path)
    }

    fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.subscribers.iter().map(|s| s.path.clone()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    fn route(&mut self, update: &ChannelUpdate) {
        self.subscribers.retain(|subscriber| {
            if paths::relative(&subscriber.path, &update.path).is_none() {
                return true;
            }
            subscriber.tx.send(update.clone()).is_ok()
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove and return every path in `written` strictly beneath `path`
fn take_beneath(written: &mut BTreeSet<String>, path: &str) -> Vec<String> {
    let beneath: Vec<String> = written
        .iter()
        .filter(|w| paths::relative(path, w).is_some_and(|rest| !rest.is_empty()))
        .cloned()
        .collect();
    for stale in &beneath {
        written.remove(stale);
    }
    beneath
}

fn topic(prefix: &str, path: &str) -> String {
    format!("{prefix}/{path}")
}

/// Filter matching `path` and everything beneath it
fn topic_filter(prefix: &str, path: &str) -> String {
    format!("{prefix}/{path}/#")
}

/// Builder for an MQTT-backed [`RemoteChannel`]
pub struct MqttChannelBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    prefix: String,
    read_timeout: Duration,
    settle: Duration,
}

pub struct MqttChannel {
    client: AsyncClient,
    prefix: String,
    registry: Arc<Mutex<Registry>>,
    connected: Arc<AtomicBool>,
    /// Paths this client has published retained values at
    written: Mutex<BTreeSet<String>>,
    read_timeout: Duration,
    settle: Duration,
    handle: tokio::task::JoinHandle<()>,
}

impl MqttChannelBuilder {
    /// Create a new MQTT client
    pub fn new(config: &MqttConfig) -> Result<Self, FloodScoutError> {
        config.validate()?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.uri, config.port);
        if config.transport == MqttTransport::Wss {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        }
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);

        Ok(Self {
            client,
            event_loop,
            prefix: config.topic_prefix.trim_matches('/').to_string(),
            read_timeout: config.read_timeout,
            settle: config.settle,
        })
    }

    /// Start the event loop. Subscriptions are (re)established on every
    /// connection acknowledgement.
    pub fn connect(self) -> MqttChannel {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let connected = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(Self::process_events(
            self.event_loop,
            self.client.clone(),
            Arc::clone(&registry),
            Arc::clone(&connected),
            self.prefix.clone(),
        ));

        MqttChannel {
            client: self.client,
            prefix: self.prefix,
            registry,
            connected,
            written: Mutex::new(BTreeSet::new()),
            read_timeout: self.read_timeout,
            settle: self.settle,
            handle,
        }
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects on its own when polled after an error, but the
    /// broker forgets subscriptions of a clean session, so they are restored
    /// here from the registry.
    async fn process_events(
        mut event_loop: EventLoop,
        client: AsyncClient,
        registry: Arc<Mutex<Registry>>,
        connected: Arc<AtomicBool>,
        prefix: String,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker, restoring subscriptions");
                    connected.store(true, Ordering::SeqCst);
                    let active = lock(&registry).paths();
                    for path in active {
                        let filter = topic_filter(&prefix, &path);
                        if let Err(e) = client.try_subscribe(&filter, QoS::AtLeastOnce) {
                            error!("Failed to subscribe to {}: {}", filter, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match Self::parse_update(&prefix, &publish.topic, &publish.payload) {
                        Ok(update) => lock(&registry).route(&update),
                        Err(e) => warn!("Failed to parse message: {}", e),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the connection");
                    connected.store(false, Ordering::SeqCst);
                }
                Ok(_) => continue,
                Err(e) => {
                    if connected.swap(false, Ordering::SeqCst) {
                        warn!("Lost connection to MQTT broker");
                    }
                    error!("MQTT Error: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Parse an incoming publish into a logical path and JSON value
    ///
    /// An empty payload clears a retained topic and reads as `null`.
    fn parse_update(
        prefix: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<ChannelUpdate, FloodScoutError> {
        let path = topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| FloodScoutError::InvalidTopic(topic.to_string()))?;
        validate_path(path).map_err(|_| FloodScoutError::InvalidTopic(topic.to_string()))?;

        let value = if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(payload)?
        };
        Ok(ChannelUpdate::new(path, value))
    }
}

impl MqttChannel {
    fn merge(root: &mut Value, path: &str, update: ChannelUpdate) {
        if let Some(relative) = paths::relative(path, &update.path) {
            tree::set(root, relative, update.value);
        }
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[async_trait]
impl RemoteChannel for MqttChannel {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, path: &str, value: Value) -> Result<(), FloodScoutError> {
        validate_path(path)?;
        let payload = serde_json::to_vec(&value)?;

        let stale = if value.is_object() {
            take_beneath(&mut lock(&self.written), path)
        } else {
            Vec::new()
        };
        for leaf in stale {
            debug!("Clearing retained topic: {}", leaf);
            self.client
                .publish(topic(&self.prefix, &leaf), QoS::AtLeastOnce, true, Vec::new())
                .await?;
        }

        self.client
            .publish(topic(&self.prefix, path), QoS::AtLeastOnce, true, payload)
            .await?;
        lock(&self.written).insert(path.to_string());
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<Subscription, FloodScoutError> {
        validate_path(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = lock(&self.registry).add(path, tx);
        let filter = topic_filter(&self.prefix, path);

        // Always subscribe, even if the filter is already active, so the
        // broker replays retained values for the newcomer.
        info!("Subscribing to topic: {}", filter);
        if let Err(e) = self.client.subscribe(&filter, QoS::AtLeastOnce).await {
            lock(&self.registry).remove(id);
            return Err(e.into());
        }

        let registry = Arc::clone(&self.registry);
        let client = self.client.clone();
        Ok(Subscription::new(path, rx, move || {
            if lock(&registry).remove(id) {
                debug!("Unsubscribing from topic: {}", filter);
                if let Err(e) = client.try_unsubscribe(&filter) {
                    warn!("Failed to unsubscribe from {}: {}", filter, e);
                }
            }
        }))
    }

    /// Collect retained values beneath `path` until the broker goes quiet
    async fn read_once(&self, path: &str) -> Result<Option<Value>, FloodScoutError> {
        let mut subscription = self.subscribe(path).await?;

        let first = match timeout(self.read_timeout, subscription.recv()).await {
            Ok(Some(update)) => update,
            Ok(None) => return Err(FloodScoutError::ChannelClosed),
            Err(_) => {
                debug!(path, "No retained value before timeout");
                return Ok(None);
            }
        };

        let mut root = Value::Null;
        Self::merge(&mut root, path, first);
        while let Ok(Some(update)) = timeout(self.settle, subscription.recv()).await {
            Self::merge(&mut root, path, update);
        }

        Ok(Some(root).filter(|v| !v.is_null()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_leaf_update() {
        let topic = "flood-scout/boatState/speed";
        let payload = "42".as_bytes();

        let update = MqttChannelBuilder::parse_update("flood-scout", topic, payload).unwrap();

        assert_eq!(update, ChannelUpdate::new("boatState/speed", json!(42)));
    }

    #[test]
    fn parse_record_update() {
        let topic = "flood-scout/history/userLocations/1705393800000";
        let payload = r#"{
            "timestamp":"2024-01-16T08:30:00Z",
            "latitude":23.8156,
            "longitude":90.4251,
            "status":"Pending"
        }"#
        .as_bytes();

        let update = MqttChannelBuilder::parse_update("flood-scout", topic, payload).unwrap();

        let expected = ChannelUpdate::new(
            "history/userLocations/1705393800000",
            json!({
                "timestamp": "2024-01-16T08:30:00Z",
                "latitude": 23.8156,
                "longitude": 90.4251,
                "status": "Pending"
            }),
        );
        assert_eq!(update, expected);
    }

    #[test]
    fn parse_cleared_topic_as_null() {
        let topic = "flood-scout/boatState/video/stream";
        let update = MqttChannelBuilder::parse_update("flood-scout", topic, b"").unwrap();
        assert_eq!(update.value, Value::Null);
    }

    #[test]
    fn parse_rejects_foreign_topics() {
        let foreign = [
            "other/boatState/speed",
            "flood-scoutx/boatState",
            "flood-scout",
            "flood-scout/",
        ];
        for topic in foreign {
            assert!(matches!(
                MqttChannelBuilder::parse_update("flood-scout", topic, b"1"),
                Err(FloodScoutError::InvalidTopic(_))
            ));
        }
        assert!(matches!(
            MqttChannelBuilder::parse_update("flood-scout", "flood-scout/boatState/speed", b"{"),
            Err(FloodScoutError::SerdeError(_))
        ));
    }

    #[test]
    fn topic_mapping() {
        assert_eq!(
            topic("flood-scout", "boatState/power"),
            "flood-scout/boatState/power"
        );
        assert_eq!(
            topic_filter("flood-scout", "boatState"),
            "flood-scout/boatState/#"
        );
    }

    #[test]
    fn registry_routes_to_matching_subscribers() {
        let mut registry = Registry::default();
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let (leaf_tx, mut leaf_rx) = mpsc::unbounded_channel();
        let state = registry.add("boatState", state_tx);
        let leaf = registry.add("boatState/location", leaf_tx);

        registry.route(&ChannelUpdate::new("boatState/speed", json!(10)));
        assert_eq!(state_rx.try_recv().unwrap().path, "boatState/speed");
        assert!(leaf_rx.try_recv().is_err());

        registry.route(&ChannelUpdate::new("boatState/location", json!({})));
        assert!(state_rx.try_recv().is_ok());
        assert!(leaf_rx.try_recv().is_ok());

        assert_eq!(registry.paths(), vec!["boatState", "boatState/location"]);
        assert!(registry.remove(leaf));
        assert!(!registry.remove(leaf));
        assert!(registry.remove(state));
        assert!(registry.paths().is_empty());
    }

    #[test]
    fn registry_keeps_path_watched_while_shared() {
        let mut registry = Registry::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.add("boatState", tx.clone());
        let second = registry.add("boatState", tx);

        assert!(!registry.remove(first));
        assert!(registry.remove(second));
    }

    #[test]
    fn record_write_takes_leaves_beneath() {
        let mut written: BTreeSet<String> = [
            "boatState/speed",
            "boatState/video/stream",
            "boatState",
            "boatStateX/speed",
            "history/userLocations/1",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let stale = take_beneath(&mut written, "boatState");

        assert_eq!(stale, vec!["boatState/speed", "boatState/video/stream"]);
        assert_eq!(
            written.into_iter().collect::<Vec<_>>(),
            vec!["boatState", "boatStateX/speed", "history/userLocations/1"]
        );
    }

    #[test]
    fn merge_assembles_subtree() {
        let mut root = Value::Null;
        MqttChannel::merge(
            &mut root,
            "history/userLocations",
            ChannelUpdate::new("history/userLocations/1", json!({ "status": "Pending" })),
        );
        MqttChannel::merge(
            &mut root,
            "history/userLocations",
            ChannelUpdate::new("history/userLocations/1/status", json!("Completed")),
        );
        MqttChannel::merge(
            &mut root,
            "history/userLocations",
            ChannelUpdate::new("boatState/power", json!(true)),
        );

        assert_eq!(root, json!({ "1": { "status": "Completed" } }));
    }
}
