//! Subscription manager
//!
//! Owns the tasks that forward channel pushes into local state. At most one
//! subscription exists per path. Releasing detaches it from the channel
//! before returning and aborts the forwarding task.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::{ChannelUpdate, RemoteChannel, SubscriptionGuard};
use crate::errors::FloodScoutError;

struct Active {
    handle: JoinHandle<()>,
    guard: SubscriptionGuard,
}

impl Active {
    fn release(self, path: &str) {
        self.handle.abort();
        drop(self.guard);
        info!(path, "Subscription released");
    }
}

#[derive(Default)]
pub struct SubscriptionManager {
    active: HashMap<String, Active>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `path` and hand each push to `on_change`.
    ///
    /// Does nothing if `path` is already active.
    pub async fn activate<C, F>(
        &mut self,
        channel: &C,
        path: &str,
        on_change: F,
    ) -> Result<(), FloodScoutError>
    where
        C: RemoteChannel + ?Sized,
        F: Fn(ChannelUpdate) + Send + 'static,
    {
        if self.is_active(path) {
            debug!(path, "Subscription already active");
            return Ok(());
        }

        let (mut rx, guard) = channel.subscribe(path).await?.into_parts();
        info!(path, channel = channel.name(), "Subscription activated");
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                on_change(update);
            }
        });
        self.active.insert(path.to_string(), Active { handle, guard });
        Ok(())
    }

    /// Detach `path` from the channel. No listener remains once this returns.
    pub fn deactivate(&mut self, path: &str) {
        if let Some(active) = self.active.remove(path) {
            active.release(path);
        }
    }

    /// Release every subscription
    pub fn deactivate_all(&mut self) {
        for (path, active) in self.active.drain() {
            active.release(&path);
        }
    }

    pub fn is_active(&self, path: &str) -> bool {
        self.active
            .get(path)
            .is_some_and(|active| !active.handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.active
            .values()
            .filter(|active| !active.handle.is_finished())
            .count()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.deactivate_all();
    }
}
