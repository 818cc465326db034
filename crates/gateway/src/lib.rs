//! Real-time fan-out gateway over tailed log streams.
//!
//! Clients connect over WebSocket and subscribe to topics. Each topic is a
//! group of append-only sub-streams in a log store; the gateway tails them
//! once per topic and fans every new entry out to all subscribers, replaying
//! a short cache to clients as they join.
//!
//! ## Architecture
//!
//! ```text
//! WebSocket ──▶ ClientActor ──ops──▶ Hub ──register/unregister──▶ TopicActor
//!                   ▲                 ▲                              │  ▲
//!                   │                 └──────idle/reroute────────────┘  │
//!                   └──────────frames / joined / left───────────────────┘
//!                                                                       │
//!                                             TailReader ──deliveries───┘
//!                                                 │
//!                                             LogStore
//! ```
//!
//! Every actor owns its state and runs one task; all interaction goes
//! through bounded mailboxes, except topic→hub events which are unbounded.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod layout;
pub mod protocol;
pub mod reader;
pub mod topic;
pub mod ws_server;

pub use client::{ClientActor, ClientEvent, ClientHandle, ClientId};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use hub::{Hub, HubHandle, HubStats, Operation};
pub use ws_server::{create_router, AppState};
