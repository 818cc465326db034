//! Read contract consumed by the gateway.

use crate::error::Result;
use crate::types::{EntryId, Fields, StreamEntry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Read-only access to a durable, append-only stream store.
///
/// Implementations are shared by every topic reader and by the hub's
/// existence checks, so they must be cheap to call concurrently.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Block until at least one stream has entries after its cursor, or until
    /// `block` elapses.
    ///
    /// # Arguments
    ///
    /// * `cursors` - `(stream, last_seen_id)` pairs
    /// * `count` - Maximum entries returned per stream
    /// * `block` - Maximum time to wait for new entries
    ///
    /// # Returns
    ///
    /// Entries in store order (grouped by stream, ascending id within a
    /// stream). Empty when the block window elapsed without data.
    async fn tail_read(
        &self,
        cursors: &[(String, EntryId)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Id of the newest entry in a stream, if any.
    async fn latest_id(&self, key: &str) -> Result<Option<EntryId>>;

    /// Up to `count` most recent entries, newest first.
    async fn reverse_range(&self, key: &str, count: usize) -> Result<Vec<(EntryId, Fields)>>;
}

/// Store handle shared across actors.
pub type SharedLogStore = Arc<dyn LogStore>;
