//! Log position / durability watermark of a storage node's replicated log.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Snapshot of a node's log: where its head is, how much has been appended
/// to the head segment, and how much of that is replicated to backups.
///
/// The same type serves two roles. As a write's *position*, the interesting
/// part is `(head_segment_id, appended_len)`, i.e., where the write landed.
/// As a node's *watermark*, `(head_segment_id, synced_len)` tells how far the
/// log is durable. The two progress at different paces, so a report may be
/// ahead in one and behind in the other; compare through `position()` or
/// `durability()` accordingly. The derived order is by position first.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub struct LogState {
    /// ID of the node's current head log segment.
    pub head_segment_id: u64,

    /// Bytes appended to the head segment.
    pub appended_len: u32,

    /// Bytes of the head segment replicated to backups.
    pub synced_len: u32,
}

impl LogState {
    /// Creates a new log state value.
    pub fn new(head_segment_id: u64, appended_len: u32, synced_len: u32) -> Self {
        debug_assert!(synced_len <= appended_len);
        LogState {
            head_segment_id,
            appended_len,
            synced_len,
        }
    }

    /// Log state of a node whose head segment is fully synced up to `len`.
    pub fn synced_at(head_segment_id: u64, len: u32) -> Self {
        Self::new(head_segment_id, len, len)
    }

    /// Where in the log this state points at.
    #[inline]
    pub fn position(&self) -> (u64, u32) {
        (self.head_segment_id, self.appended_len)
    }

    /// How far the log is durable according to this state. Segments older
    /// than the head are closed, so a newer head with less synced is still
    /// more durable.
    #[inline]
    pub fn durability(&self) -> (u64, u32) {
        (self.head_segment_id, self.synced_len)
    }

    /// Returns true if a write located at this position is durable under the
    /// given watermark. Segments older than the watermark's head are closed
    /// and therefore fully replicated.
    #[inline]
    pub fn is_synced(&self, watermark: &LogState) -> bool {
        self.head_segment_id < watermark.head_segment_id
            || (self.head_segment_id == watermark.head_segment_id
                && self.appended_len <= watermark.synced_len)
    }
}

impl fmt::Display for LogState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}:{}/{}>",
            self.head_segment_id, self.synced_len, self.appended_len
        )
    }
}

#[cfg(test)]
mod logstate_tests {
    use super::*;

    #[test]
    fn order_lexicographic() {
        let a = LogState::new(1, 100, 40);
        assert!(a < LogState::new(1, 100, 60));
        assert!(a < LogState::new(1, 120, 0));
        assert!(a < LogState::new(2, 0, 0));
        assert!(a > LogState::new(0, 999, 999));
        assert_eq!(a, LogState::new(1, 100, 40));
        assert_eq!(LogState::default(), LogState::new(0, 0, 0));
    }

    #[test]
    fn position_and_durability_diverge() {
        // appended less but synced more, as seen on a reordered reply
        let earlier = LogState::new(0, 9, 0);
        let later = LogState::new(0, 7, 7);
        assert!(later.position() < earlier.position());
        assert!(later.durability() > earlier.durability());
        assert!(LogState::new(1, 0, 0).durability() > later.durability());
    }

    #[test]
    fn synced_same_segment() {
        let pos = LogState::new(3, 50, 0);
        assert!(!pos.is_synced(&LogState::new(3, 80, 49)));
        assert!(pos.is_synced(&LogState::new(3, 80, 50)));
        assert!(pos.is_synced(&LogState::synced_at(3, 80)));
    }

    #[test]
    fn synced_across_segments() {
        let pos = LogState::new(3, 50, 0);
        assert!(pos.is_synced(&LogState::new(4, 10, 0)));
        assert!(!pos.is_synced(&LogState::synced_at(2, 1000)));
    }

    #[test]
    fn display_format() {
        assert_eq!(format!("{}", LogState::new(2, 30, 10)), "<2:10/30>");
    }
}
