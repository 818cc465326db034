//! Tail reader: follows one topic's sub-streams and feeds its topic actor.

use crate::config::ReaderConfig;
use crate::protocol::{data_frame, Frame, TopicId};
use log_store::{EntryId, SharedLogStore, StreamEntry};
use metrics::counter;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Extra time allowed past the block window before a read counts as hung.
const READ_GRACE: Duration = Duration::from_secs(5);

/// One entry read from a sub-stream, serialized and ready for fan-out.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Index of the sub-stream in the topic layout.
    pub sub_stream: usize,
    pub id: EntryId,
    pub payload: Frame,
}

/// Blocking multi-stream reader paired with one topic actor.
pub struct TailReader {
    topic_id: TopicId,
    streams: Vec<String>,
    /// Last seen id per stream, parallel to `streams`.
    cursors: Vec<EntryId>,
    store: SharedLogStore,
    deliveries: mpsc::Sender<Delivery>,
    config: ReaderConfig,
    cancel: CancellationToken,
}

impl TailReader {
    pub fn new(
        topic_id: TopicId,
        streams: Vec<String>,
        cursors: Vec<EntryId>,
        store: SharedLogStore,
        deliveries: mpsc::Sender<Delivery>,
        config: ReaderConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topic_id,
            streams,
            cursors,
            store,
            deliveries,
            config,
            cancel,
        }
    }

    /// Read until cancelled or until the topic stops accepting deliveries.
    pub async fn run(mut self) {
        debug!("Tail reader for {} started at {:?}", self.topic_id, self.cursors);
        let deadline = self.config.block_timeout + READ_GRACE;
        let mut failures: u32 = 0;

        'read: loop {
            let cursors: Vec<(String, EntryId)> = self
                .streams
                .iter()
                .cloned()
                .zip(self.cursors.iter().cloned())
                .collect();

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                read = timeout(
                    deadline,
                    self.store.tail_read(&cursors, self.config.read_count, self.config.block_timeout),
                ) => read,
            };

            let failure = match read {
                Ok(Ok(entries)) => {
                    failures = 0;
                    for entry in entries {
                        if !self.forward(entry).await {
                            break 'read;
                        }
                    }
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no reply within {:?}", deadline),
            };

            let delay = self.config.backoff.next(failures);
            failures = failures.saturating_add(1);
            warn!(
                "Tail read for {} failed ({}), retry {} in {:?}",
                self.topic_id, failure, failures, delay
            );
            counter!("gateway_store_errors_total", "op" => "tail_read").increment(1);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        debug!("Tail reader for {} stopped", self.topic_id);
    }

    /// Advance the cursor and hand the entry to the topic. Returns false once
    /// the reader should stop.
    async fn forward(&mut self, entry: StreamEntry) -> bool {
        let Some(sub_stream) = self.streams.iter().position(|s| *s == entry.stream) else {
            warn!("Tail read for {} returned unknown stream {}", self.topic_id, entry.stream);
            return true;
        };
        self.cursors[sub_stream] = entry.id.clone();

        let payload = match data_frame(&entry.fields) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize entry from {}: {}", entry.stream, e);
                return true;
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.deliveries.send(Delivery { sub_stream, id: entry.id, payload }) => sent.is_ok(),
        }
    }
}
