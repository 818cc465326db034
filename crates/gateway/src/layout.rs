//! Mapping from a topic id to its store keys.

/// One named sub-stream of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubStream {
    /// Key suffix appended to the topic id (e.g. `::public_trades`).
    pub suffix: String,
    /// Replay cache capacity for this sub-stream.
    pub capacity: usize,
}

impl SubStream {
    pub fn new(suffix: impl Into<String>, capacity: usize) -> Self {
        Self {
            suffix: suffix.into(),
            capacity,
        }
    }
}

/// Store key layout shared by every topic.
///
/// A topic `T` exists iff `T{existence_suffix}` exists in the store, and is
/// backed by one stream per entry in `sub_streams`, keyed `T{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    pub existence_suffix: String,
    pub sub_streams: Vec<SubStream>,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            existence_suffix: "::markets".to_string(),
            sub_streams: vec![
                SubStream::new("::public_trades", 30),
                SubStream::new("::public_bid", 1),
                SubStream::new("::public_ask", 1),
            ],
        }
    }
}

impl TopicLayout {
    /// Key checked before a topic is created.
    pub fn existence_key(&self, topic_id: &str) -> String {
        format!("{}{}", topic_id, self.existence_suffix)
    }

    /// Stream keys of every sub-stream, in layout order.
    pub fn stream_keys(&self, topic_id: &str) -> Vec<String> {
        self.sub_streams
            .iter()
            .map(|sub| format!("{}{}", topic_id, sub.suffix))
            .collect()
    }
}
