//! Redis Streams backend.
//!
//! Short commands (`EXISTS`, `XREVRANGE`) share one multiplexed connection.
//! `XREAD BLOCK` holds its connection for up to the whole block window, so
//! each tail read runs on a dedicated connection taken from a small idle pool.

use crate::error::Result;
use crate::store::LogStore;
use crate::types::{EntryId, Fields, StreamEntry};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Idle blocking-read connections kept for reuse.
const MAX_IDLE_READERS: usize = 32;

/// Log store backed by Redis Streams.
pub struct RedisLogStore {
    client: redis::Client,
    /// Shared connection for non-blocking commands.
    conn: MultiplexedConnection,
    /// Dedicated connections for `XREAD BLOCK`.
    idle_readers: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisLogStore {
    /// Connect to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis log store");
        Ok(Self {
            client,
            conn,
            idle_readers: Mutex::new(Vec::new()),
        })
    }

    async fn checkout_reader(&self) -> Result<MultiplexedConnection> {
        let idle = self
            .idle_readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                debug!("Opening dedicated tail-read connection");
                Ok(self.client.get_multiplexed_async_connection().await?)
            }
        }
    }

    fn checkin_reader(&self, conn: MultiplexedConnection) {
        let mut idle = self
            .idle_readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }
}

fn decode_fields(entry: &StreamId) -> Fields {
    entry
        .map
        .iter()
        .map(|(field, value)| {
            let value = match value {
                // Stream values are not guaranteed UTF-8.
                redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                other => redis::from_redis_value::<String>(other)
                    .unwrap_or_else(|_| format!("{:?}", other)),
            };
            (field.clone(), value)
        })
        .collect()
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn tail_read(
        &self,
        cursors: &[(String, EntryId)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let keys: Vec<&str> = cursors.iter().map(|(key, _)| key.as_str()).collect();
        let ids: Vec<&str> = cursors.iter().map(|(_, id)| id.as_str()).collect();
        let options = StreamReadOptions::default()
            .count(count)
            .block(block.as_millis() as usize);

        // A connection that errored (or whose read was dropped) is not reused.
        let mut conn = self.checkout_reader().await?;
        let reply: Option<StreamReadReply> = conn.xread_options(&keys, &ids, &options).await?;
        self.checkin_reader(conn);

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let entries = reply
            .keys
            .into_iter()
            .flat_map(|stream| {
                let key = stream.key;
                stream.ids.into_iter().map(move |entry| StreamEntry {
                    stream: key.clone(),
                    fields: decode_fields(&entry),
                    id: entry.id,
                })
            })
            .collect();
        Ok(entries)
    }

    async fn latest_id(&self, key: &str) -> Result<Option<EntryId>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(key, "+", "-", 1).await?;
        Ok(reply.ids.into_iter().next().map(|entry| entry.id))
    }

    async fn reverse_range(&self, key: &str, count: usize) -> Result<Vec<(EntryId, Fields)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(key, "+", "-", count).await?;
        Ok(reply
            .ids
            .iter()
            .map(|entry| (entry.id.clone(), decode_fields(entry)))
            .collect())
    }
}
