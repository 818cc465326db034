//! In-process log store.
//!
//! Streams live in a map guarded by a short-held mutex; blocked tail reads
//! park on a [`Notify`] that every append wakes.

use crate::error::{Error, Result};
use crate::store::LogStore;
use crate::types::{compare_ids, EntryId, Fields, StreamEntry};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Log store held entirely in memory.
#[derive(Default)]
pub struct MemoryLogStore {
    streams: Mutex<HashMap<String, Vec<(EntryId, Fields)>>>,
    next_seq: AtomicU64,
    appended: Notify,
    unavailable: AtomicBool,
}

impl MemoryLogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, returning its id. Wakes blocked tail reads.
    pub fn append<I, K, V>(&self, key: &str, fields: I) -> EntryId
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let id = format!("{}-0", seq);
        let fields: Fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push((id.clone(), fields));

        self.appended.notify_waiters();
        id
    }

    /// Make every operation fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
        self.appended.notify_waiters();
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            Err(Error::Unavailable)
        } else {
            Ok(())
        }
    }

    fn collect_after(&self, cursors: &[(String, EntryId)], count: usize) -> Vec<StreamEntry> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = Vec::new();
        for (key, cursor) in cursors {
            let Some(stream) = streams.get(key) else {
                continue;
            };
            entries.extend(
                stream
                    .iter()
                    .filter(|(id, _)| compare_ids(id, cursor) == Ordering::Greater)
                    .take(count)
                    .map(|(id, fields)| StreamEntry {
                        stream: key.clone(),
                        id: id.clone(),
                        fields: fields.clone(),
                    }),
            );
        }
        entries
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(streams.contains_key(key))
    }

    async fn tail_read(
        &self,
        cursors: &[(String, EntryId)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // Register interest before looking, so an append in between is not missed.
            notified.as_mut().enable();

            self.check_available()?;
            let entries = self.collect_after(cursors, count);
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn latest_id(&self, key: &str) -> Result<Option<EntryId>> {
        self.check_available()?;
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(key)
            .and_then(|stream| stream.last())
            .map(|(id, _)| id.clone()))
    }

    async fn reverse_range(&self, key: &str, count: usize) -> Result<Vec<(EntryId, Fields)>> {
        self.check_available()?;
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(key)
            .map(|stream| stream.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }
}
