//! Column family definitions for the RocksDB state store
//!
//! Each column family provides logical separation of data types
//! while sharing the same RocksDB instance.

/// Column family for handoff ledger records, ordered by conversation and time
pub const CF_RECORDS: &str = "records";

/// Column family mapping record id to its key in [`CF_RECORDS`]
pub const CF_RECORD_INDEX: &str = "record_index";

/// Column family mapping conversation to its pending record key
pub const CF_PENDING: &str = "pending";

/// Column family for per-conversation rate-limit counters
pub const CF_RATE_LIMITS: &str = "rate_limits";

/// Column family for threshold checkpoints
pub const CF_THRESHOLDS: &str = "thresholds";

/// Column family for the outcome log
pub const CF_OUTCOMES: &str = "outcomes";

/// All column family names
pub const ALL_CFS: &[&str] = &[
    CF_RECORDS,
    CF_RECORD_INDEX,
    CF_PENDING,
    CF_RATE_LIMITS,
    CF_THRESHOLDS,
    CF_OUTCOMES,
];

/// Key builders for compound keys
pub mod keys {
    use chrono::{DateTime, Utc};

    use crate::types::Transition;

    /// Non-negative microsecond timestamp, zero-padded so keys sort by time.
    fn micros(at: DateTime<Utc>) -> String {
        format!("{:020}", at.timestamp_micros().max(0))
    }

    /// Prefix shared by all records of one conversation.
    ///
    /// The key is length-prefixed so that no conversation's prefix is a
    /// prefix of another's.
    pub fn conversation_prefix(conversation: &str) -> String {
        format!("rec:{}:{}:", conversation.len(), conversation)
    }

    /// Create a record key
    pub fn record(conversation: &str, decided_at: DateTime<Utc>, id: &str) -> String {
        format!(
            "{}{}:{}",
            conversation_prefix(conversation),
            micros(decided_at),
            id
        )
    }

    /// Create a record index key
    pub fn record_index(id: &str) -> String {
        format!("id:{}", id)
    }

    /// Create a pending-record key
    pub fn pending(conversation: &str) -> String {
        format!("pend:{}", conversation)
    }

    /// Create a rate-limit key
    pub fn rate_limit(conversation: &str) -> String {
        format!("rate:{}", conversation)
    }

    /// Create a threshold checkpoint key
    pub fn threshold(transition: Transition) -> String {
        format!("thr:{}", transition)
    }

    /// Create an outcome key (timestamp-based for ordering)
    pub fn outcome(transition: Transition, recorded_at: DateTime<Utc>, id: &str) -> String {
        format!("out:{}:{}:{}", transition, micros(recorded_at), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentType, Transition};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_key_generation() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(keys::pending("c-1"), "pend:c-1");
        assert_eq!(keys::rate_limit("c-1"), "rate:c-1");
        assert_eq!(keys::record_index("abc"), "id:abc");
        assert_eq!(
            keys::threshold(Transition::new(AgentType::Lead, AgentType::Buyer)),
            "thr:lead->buyer"
        );
        assert_eq!(
            keys::record("c-1", at, "abc"),
            "rec:3:c-1:00001700000000000000:abc"
        );
    }

    #[test]
    fn test_record_keys_ordered_by_time() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let earlier = keys::record("c-1", at, "b");
        let later = keys::record("c-1", at + Duration::seconds(1), "a");
        assert!(earlier < later);
    }

    #[test]
    fn test_conversation_prefixes_disjoint() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let nested = keys::record("a:b", at, "x");
        assert!(!nested.starts_with(&keys::conversation_prefix("a")));
        assert!(nested.starts_with(&keys::conversation_prefix("a:b")));
    }
}
