//! Merging remote change notifications into the local cache - NO I/O.
//!
//! This module provides:
//! - [`decide`]: echo / stale / apply decision for one notification
//! - [`normalize`]: the cached representation of an applied notification
//! - [`SequenceTracker`]: contiguous tenant sequence tracking with gap detection
//!
//! Notifications may arrive out of order, twice (live channel and resync
//! overlap), or as echoes of this device's own writes. Whole-record
//! last-writer-wins on the remote-assigned version keeps merging idempotent.

use std::collections::BTreeSet;
use sync_types::{
    CachedRecord, ChangeNotification, DeviceId, OperationType, Sequence, Timestamp, Version,
};

/// What to do with an inbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Produced by this device; it is already applied locally.
    Echo,
    /// Not newer than the cached copy.
    Stale,
    /// Newer than the cached copy: upsert and dispatch.
    Apply,
}

/// Classify a notification against this device and the cached version.
///
/// `cached_version` is `None` when the record is absent or only exists as an
/// unacknowledged local create.
pub fn decide(
    notification: &ChangeNotification,
    local_device: &DeviceId,
    cached_version: Option<Version>,
) -> MergeDecision {
    if &notification.origin_device_id == local_device {
        return MergeDecision::Echo;
    }
    match cached_version {
        Some(cached) if notification.version <= cached => MergeDecision::Stale,
        _ => MergeDecision::Apply,
    }
}

/// Local representation of an applied notification.
///
/// Deletes become tombstones so that a late, older update cannot resurrect
/// the record.
pub fn normalize(notification: &ChangeNotification, now: Timestamp) -> CachedRecord {
    let deleted = notification.operation == OperationType::Delete;
    CachedRecord {
        entity: notification.entity.clone(),
        version: Some(notification.version),
        payload: if deleted {
            Vec::new()
        } else {
            notification.payload.clone()
        },
        deleted,
        updated_at: now,
    }
}

/// Tracks received tenant sequences and detects gaps.
///
/// The contiguous sequence is the resume point for resync: every change up
/// to it has been seen.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    /// Received sequences above the contiguous point.
    received: BTreeSet<u64>,
    contiguous: u64,
}

impl SequenceTracker {
    /// Gap size above which the tracker stops enumerating missing sequences.
    const MAX_GAP: u64 = 10_000;

    /// Start at sequence 0 (nothing seen).
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted contiguous sequence.
    pub fn with_sequence(sequence: Sequence) -> Self {
        Self {
            received: BTreeSet::new(),
            contiguous: sequence.value(),
        }
    }

    /// Record a received sequence. Returns `false` if it was already seen.
    pub fn received(&mut self, sequence: Sequence) -> bool {
        let value = sequence.value();
        if value <= self.contiguous {
            return false;
        }
        let fresh = self.received.insert(value);
        self.advance();
        fresh
    }

    /// Everything up to this sequence has been seen.
    pub fn contiguous(&self) -> Sequence {
        Sequence::new(self.contiguous)
    }

    /// Highest sequence seen.
    pub fn highest(&self) -> Sequence {
        Sequence::new(self.received.last().copied().unwrap_or(self.contiguous))
    }

    /// Whether some sequence below the highest seen is missing.
    pub fn has_gaps(&self) -> bool {
        !self.received.is_empty()
    }

    /// Missing sequences between the contiguous point and the highest seen.
    ///
    /// Empty if the gap is larger than `MAX_GAP`; a resync covers it anyway.
    pub fn missing(&self) -> Vec<Sequence> {
        let Some(&highest) = self.received.last() else {
            return Vec::new();
        };
        if highest.saturating_sub(self.contiguous) > Self::MAX_GAP {
            return Vec::new();
        }
        ((self.contiguous + 1)..=highest)
            .filter(|s| !self.received.contains(s))
            .map(Sequence::new)
            .collect()
    }

    /// Mark everything up to `sequence` as seen (after a resync page).
    pub fn acknowledge_up_to(&mut self, sequence: Sequence) {
        let value = sequence.value();
        self.received.retain(|&s| s > value);
        if value > self.contiguous {
            self.contiguous = value;
        }
        self.advance();
    }

    fn advance(&mut self) {
        let mut next = self.contiguous + 1;
        while self.received.remove(&next) {
            self.contiguous = next;
            next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{EntityKey, MutationId, TenantId, UserId};

    fn notification(device: DeviceId, version: u64, op: OperationType) -> ChangeNotification {
        ChangeNotification {
            tenant_id: TenantId::new("acme"),
            entity: EntityKey::new("invoice", "R1"),
            operation: op,
            version: Version::new(version),
            sequence: Sequence::new(version),
            payload: b"{\"amount\":50}".to_vec(),
            origin_user_id: UserId::new("bob"),
            origin_device_id: device,
            mutation_id: MutationId::new(),
        }
    }

    #[test]
    fn own_device_is_echo_even_if_newer() {
        let me = DeviceId::new();
        let n = notification(me, 9, OperationType::Update);
        assert_eq!(decide(&n, &me, Some(Version::new(1))), MergeDecision::Echo);
    }

    #[test]
    fn equal_or_older_version_is_stale() {
        let n = notification(DeviceId::new(), 3, OperationType::Update);
        let me = DeviceId::new();
        assert_eq!(decide(&n, &me, Some(Version::new(3))), MergeDecision::Stale);
        assert_eq!(decide(&n, &me, Some(Version::new(4))), MergeDecision::Stale);
    }

    #[test]
    fn newer_or_unknown_is_applied() {
        let n = notification(DeviceId::new(), 3, OperationType::Update);
        let me = DeviceId::new();
        assert_eq!(decide(&n, &me, Some(Version::new(2))), MergeDecision::Apply);
        assert_eq!(decide(&n, &me, None), MergeDecision::Apply);
    }

    #[test]
    fn delete_normalizes_to_tombstone() {
        let n = notification(DeviceId::new(), 4, OperationType::Delete);
        let record = normalize(&n, 77);
        assert!(record.deleted);
        assert!(record.payload.is_empty());
        assert_eq!(record.version, Some(Version::new(4)));
        assert_eq!(record.updated_at, 77);
    }

    #[test]
    fn update_keeps_payload() {
        let n = notification(DeviceId::new(), 2, OperationType::Update);
        let record = normalize(&n, 0);
        assert!(!record.deleted);
        assert_eq!(record.payload, n.payload);
    }

    #[test]
    fn tracker_in_order() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.received(Sequence::new(1)));
        assert!(tracker.received(Sequence::new(2)));
        assert_eq!(tracker.contiguous(), Sequence::new(2));
        assert!(!tracker.has_gaps());
    }

    #[test]
    fn tracker_detects_gap() {
        let mut tracker = SequenceTracker::new();
        tracker.received(Sequence::new(1));
        tracker.received(Sequence::new(4));
        assert!(tracker.has_gaps());
        assert_eq!(tracker.contiguous(), Sequence::new(1));
        assert_eq!(tracker.highest(), Sequence::new(4));
        assert_eq!(tracker.missing(), vec![Sequence::new(2), Sequence::new(3)]);
    }

    #[test]
    fn tracker_fills_gap_out_of_order() {
        let mut tracker = SequenceTracker::new();
        tracker.received(Sequence::new(2));
        tracker.received(Sequence::new(1));
        assert_eq!(tracker.contiguous(), Sequence::new(2));
        assert!(!tracker.has_gaps());
    }

    #[test]
    fn tracker_reports_duplicates() {
        let mut tracker = SequenceTracker::with_sequence(Sequence::new(5));
        assert!(!tracker.received(Sequence::new(5)));
        assert!(tracker.received(Sequence::new(7)));
        assert!(!tracker.received(Sequence::new(7)));
    }

    #[test]
    fn tracker_huge_gap_enumerates_nothing() {
        let mut tracker = SequenceTracker::new();
        tracker.received(Sequence::new(50_000));
        assert!(tracker.has_gaps());
        assert!(tracker.missing().is_empty());
    }

    #[test]
    fn acknowledge_closes_gap() {
        let mut tracker = SequenceTracker::new();
        tracker.received(Sequence::new(1));
        tracker.received(Sequence::new(5));
        tracker.received(Sequence::new(6));
        tracker.acknowledge_up_to(Sequence::new(4));
        assert_eq!(tracker.contiguous(), Sequence::new(6));
        assert!(!tracker.has_gaps());
    }
}
