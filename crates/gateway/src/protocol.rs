//! WebSocket protocol message types.
//!
//! Inbound text frames are JSON requests:
//!
//! ```text
//! {"op": "subscribe" | "unsubscribe", "args": "topicA,topicB"}
//! ```
//!
//! Outbound frames are acknowledgements, plain-text `error:` strings, or the
//! raw serialized fields of one log entry.

use crate::error::Result;
use axum::extract::ws::Utf8Bytes;
use log_store::Fields;
use serde::{Deserialize, Serialize};

/// External topic key (e.g. an instrument symbol).
pub type TopicId = String;

/// Serialized outbound text frame. Cloning shares the underlying buffer.
pub type Frame = Utf8Bytes;

/// Error text sent for requests that are not valid JSON requests.
pub const MALFORMED_REQUEST: &str = "Message format";

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Request sent from client to server.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    /// Operation name.
    pub op: String,
    /// Comma-separated topic ids.
    #[serde(default)]
    pub args: String,
}

/// Operation kind of a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Subscribe,
    Unsubscribe,
    /// Accepted but ignored.
    Other(String),
}

impl From<&str> for OpKind {
    fn from(op: &str) -> Self {
        match op {
            "subscribe" => OpKind::Subscribe,
            "unsubscribe" => OpKind::Unsubscribe,
            other => OpKind::Other(other.to_string()),
        }
    }
}

impl ClientRequest {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> OpKind {
        OpKind::from(self.op.as_str())
    }

    pub fn topic_ids(&self) -> Vec<TopicId> {
        parse_topic_ids(&self.args)
    }
}

/// Split a comma-separated topic list, dropping empty segments.
pub fn parse_topic_ids(args: &str) -> Vec<TopicId> {
    args.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Subscription acknowledgement.
#[derive(Debug, Serialize)]
struct SubscriptionAck<'a> {
    success: &'static str,
    subscriptions: &'a [TopicId],
}

/// `{"success":"true","subscriptions":[...]}`
pub fn ack_frame(subscriptions: &[TopicId]) -> Result<Frame> {
    let ack = SubscriptionAck {
        success: "true",
        subscriptions,
    };
    Ok(serde_json::to_string(&ack)?.into())
}

/// Plain-text error frame, `error: <message>`.
pub fn error_frame(message: &str) -> Frame {
    format!("error: {}", message).into()
}

/// Error frame for a subscribe to a topic the store does not know.
pub fn topic_missing_frame(topic_id: &str) -> Frame {
    error_frame(&format!("Topic does not exist {}", topic_id))
}

/// Error frame for a subscribe that a stuck topic could not take.
pub fn topic_unavailable_frame(topic_id: &str) -> Frame {
    error_frame(&format!("Topic unavailable {}", topic_id))
}

/// Data frame carrying the fields of one log entry.
pub fn data_frame(fields: &Fields) -> Result<Frame> {
    Ok(serde_json::to_string(fields)?.into())
}
