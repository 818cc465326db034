//! Append-only, offset-addressable stream log store.
//!
//! The gateway only ever reads from the store. This crate defines the
//! read contract ([`LogStore`]) and two backends:
//! - [`RedisLogStore`]: Redis Streams (`EXISTS`, `XREAD BLOCK`, `XREVRANGE`)
//! - [`MemoryLogStore`]: in-process streams for tests and local runs
//!
//! # Example
//!
//! ```ignore
//! use log_store::{LogStore, RedisLogStore};
//!
//! let store = RedisLogStore::connect("redis://127.0.0.1:6379").await?;
//! if store.exists("BTCUSD::markets").await? {
//!     let latest = store.latest_id("BTCUSD::public_trades").await?;
//! }
//! ```

pub mod error;
pub mod memory;
pub mod redis_client;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use memory::MemoryLogStore;
pub use redis_client::RedisLogStore;
pub use store::{LogStore, SharedLogStore};
pub use types::{compare_ids, EntryId, Fields, StreamEntry, FROM_START};
