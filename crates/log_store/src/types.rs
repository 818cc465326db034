//! Entry and cursor types shared by every backend.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Entry id as assigned by the store, shaped `<ms>-<seq>`.
pub type EntryId = String;

/// Field map of one entry. Ordered so serialized output is stable.
pub type Fields = BTreeMap<String, String>;

/// Cursor sentinel meaning "from the beginning of the stream".
pub const FROM_START: &str = "0";

/// One entry returned by a tail read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Stream key the entry was read from.
    pub stream: String,
    /// Entry id.
    pub id: EntryId,
    /// Entry fields.
    pub fields: Fields,
}

fn parse_id(id: &str) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, 0)),
    }
}

/// Order two entry ids the way the store does.
///
/// Ids compare numerically by `(ms, seq)`; `"0"` is the smallest id. Ids that
/// do not parse fall back to plain string ordering.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (parse_id(a), parse_id(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
