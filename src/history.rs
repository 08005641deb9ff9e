//! Mission history
//!
//! Saved rescue locations live under `history/userLocations/{id}` on the
//! remote channel. The store appends records and edits their status; the
//! view keeps a sorted, paginated mirror for display.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::RemoteChannel;
use crate::errors::FloodScoutError;
use crate::models::{paths, HistoryRecord, MissionStatus};
use crate::subscriptions::SubscriptionManager;

/// Visible window `[start, end)` over a list, grown a page at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    start: usize,
    end: usize,
    len: usize,
    page_size: usize,
}

impl Pagination {
    pub fn new(page_size: usize, len: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            start: 0,
            end: page_size.min(len),
            len,
            page_size,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    pub fn has_more(&self) -> bool {
        self.end < self.len
    }

    /// Extend the window by one page, capped at the list length
    pub fn on_scroll_bottom(&mut self) -> usize {
        self.end = (self.end + self.page_size).min(self.len);
        self.end
    }

    /// Track a new list length. The window never shrinks unless the list does.
    pub fn resize(&mut self, len: usize) {
        self.len = len;
        self.end = self.end.max(self.page_size.min(len)).min(len);
    }
}

/// Writes to the remote history collection
pub struct HistoryStore<C: RemoteChannel + ?Sized> {
    channel: Arc<C>,
}

impl<C: RemoteChannel + ?Sized> Clone for HistoryStore<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
        }
    }
}

impl<C: RemoteChannel + ?Sized> HistoryStore<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }

    /// Store a new record under its id
    pub async fn append(&self, record: &HistoryRecord) -> Result<(), FloodScoutError> {
        let value = serde_json::to_value(record)?;
        self.channel
            .publish(&paths::user_location(record.id), value)
            .await?;
        info!(id = record.id, "Mission record saved");
        Ok(())
    }

    /// Overwrite the status field of an existing record, and nothing else
    pub async fn update_status(
        &self,
        id: i64,
        status: MissionStatus,
    ) -> Result<(), FloodScoutError> {
        let value = serde_json::to_value(status)?;
        self.channel
            .publish(&paths::user_location_status(id), value)
            .await?;
        info!(id, %status, "Mission status updated");
        Ok(())
    }

    /// Fetch every record, newest first
    pub async fn load_all(&self) -> Result<Vec<HistoryRecord>, FloodScoutError> {
        let value = self.channel.read_once(paths::USER_LOCATIONS).await?;
        let mut records = value.as_ref().map(collect_records).unwrap_or_default();
        sort_newest_first(&mut records);
        Ok(records)
    }
}

/// Parse a map of stored records, skipping entries that do not parse
pub fn collect_records(value: &Value) -> Vec<HistoryRecord> {
    let Some(entries) = value.as_object() else {
        warn!("History payload is not an object");
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(key, entry)| match HistoryRecord::from_entry(key, entry) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, "Skipping malformed history record: {}", e);
                None
            }
        })
        .collect()
}

fn sort_newest_first(records: &mut [HistoryRecord]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryState {
    /// Newest first
    pub records: Vec<HistoryRecord>,
    pub window: Pagination,
}

impl HistoryState {
    pub fn new(page_size: usize) -> Self {
        Self {
            records: Vec::new(),
            window: Pagination::new(page_size, 0),
        }
    }

    pub fn visible(&self) -> &[HistoryRecord] {
        &self.records[self.window.range()]
    }

    /// Mission number as displayed: 1 for the oldest record
    pub fn mission_number(&self, index: usize) -> usize {
        self.records.len() - index
    }

    /// Replace the whole list, returning whether it differed
    pub fn replace_all(&mut self, mut records: Vec<HistoryRecord>) -> bool {
        sort_newest_first(&mut records);
        if records == self.records {
            return false;
        }
        self.records = records;
        self.window.resize(self.records.len());
        true
    }

    /// Apply a pushed value for the history collection
    pub fn apply_update(&mut self, path: &str, value: &Value) -> bool {
        let Some(relative) = paths::relative(paths::USER_LOCATIONS, path) else {
            return false;
        };
        let parts: Vec<&str> = relative.split('/').collect();

        match parts.as_slice() {
            [""] => self.replace_all(collect_records(value)),
            [key] => match HistoryRecord::from_entry(key, value) {
                Ok(record) => self.upsert(record),
                Err(e) => {
                    warn!(key, "Ignoring malformed history record: {}", e);
                    false
                }
            },
            [key, "status"] => {
                let (Ok(id), Ok(status)) = (
                    key.parse::<i64>(),
                    serde_json::from_value::<MissionStatus>(value.clone()),
                ) else {
                    warn!(path, "Ignoring malformed status update");
                    return false;
                };
                self.set_status(id, status)
            }
            _ => {
                debug!(path, "Ignoring update to immutable record field");
                false
            }
        }
    }

    /// Insert a new record. For a known id only the status is taken over.
    fn upsert(&mut self, record: HistoryRecord) -> bool {
        if self.records.iter().any(|r| r.id == record.id) {
            return self.set_status(record.id, record.status);
        }
        self.records.push(record);
        sort_newest_first(&mut self.records);
        self.window.resize(self.records.len());
        true
    }

    fn set_status(&mut self, id: i64, status: MissionStatus) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(record) if record.status != status => {
                record.status = status;
                true
            }
            _ => false,
        }
    }
}

/// History screen: loads on mount, follows pushes while mounted
pub struct HistoryView<C: RemoteChannel + ?Sized> {
    store: HistoryStore<C>,
    channel: Arc<C>,
    state: Arc<watch::Sender<HistoryState>>,
    subscriptions: SubscriptionManager,
}

impl<C: RemoteChannel + ?Sized + 'static> HistoryView<C> {
    pub fn new(channel: Arc<C>, page_size: usize) -> Self {
        let (state, _) = watch::channel(HistoryState::new(page_size));
        Self {
            store: HistoryStore::new(Arc::clone(&channel)),
            channel,
            state: Arc::new(state),
            subscriptions: SubscriptionManager::new(),
        }
    }

    pub fn watch(&self) -> watch::Receiver<HistoryState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> HistoryState {
        self.state.borrow().clone()
    }

    /// Load the collection and follow it. Channel failures are logged and
    /// leave the previous state in place.
    pub async fn mount(&mut self) {
        match self.store.load_all().await {
            Ok(records) => {
                self.state.send_if_modified(|s| s.replace_all(records));
            }
            Err(e) => warn!("Failed to load history: {}", e),
        }

        let state = Arc::clone(&self.state);
        let result = self
            .subscriptions
            .activate(self.channel.as_ref(), paths::USER_LOCATIONS, move |update| {
                state.send_if_modified(|s| s.apply_update(&update.path, &update.value));
            })
            .await;
        if let Err(e) = result {
            warn!("Failed to follow history: {}", e);
        }
    }

    pub fn unmount(&mut self) {
        self.subscriptions.deactivate_all();
    }

    pub fn is_mounted(&self) -> bool {
        self.subscriptions.is_active(paths::USER_LOCATIONS)
    }

    pub fn on_scroll_bottom(&self) -> usize {
        let mut end = 0;
        self.state.send_modify(|s| end = s.window.on_scroll_bottom());
        end
    }

    /// Operator edit of a record's status, applied locally right away
    pub async fn set_status(&self, id: i64, status: MissionStatus) -> Result<(), FloodScoutError> {
        if !self.state.borrow().records.iter().any(|r| r.id == id) {
            return Err(FloodScoutError::RecordNotFound(id));
        }
        self.state.send_if_modified(|s| s.set_status(id, status));
        if let Err(e) = self.store.update_status(id, status).await {
            warn!(id, "Failed to store mission status: {}", e);
        }
        Ok(())
    }
}
