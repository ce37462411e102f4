//! Mutation queue ordering for offsync.
//!
//! This module provides the in-memory model of the sync queue with:
//! - Enqueue order preserved per entity (entries are never reordered)
//! - Head-of-entity selection, so an entity backing off or quarantined does
//!   not hold up other entities
//! - Retry bookkeeping and quarantine of permanently failed entries
//! - Base version chaining between consecutive mutations of one entity
//! - Max size limits to prevent unbounded growth
//!
//! sync-client persists every change made here to the local store; this
//! module only decides *what* changes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use sync_types::{
    EntityKey, EntryStatus, MutationId, OperationType, SyncQueueEntry, TenantId, Timestamp,
    Version, LOCAL_ORIGIN,
};

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueStateError {
    /// Queue is at capacity.
    #[error("queue full (capacity: {capacity})")]
    Full {
        /// Current queue capacity.
        capacity: usize,
    },
    /// No entry with this id.
    #[error("unknown queue entry {0}")]
    UnknownEntry(MutationId),
    /// The entry is not in a state that allows the requested change.
    #[error("queue entry {id} is {status:?}")]
    InvalidStatus {
        /// The entry.
        id: MutationId,
        /// Its current status.
        status: EntryStatus,
    },
}

/// Caller decision for a quarantined entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Drop the mutation. Later mutations of the entity rebase on what the
    /// remote still has.
    Discard,
    /// Send it again unchanged (e.g. after fixing a validation problem remotely).
    Retry,
    /// Send it again on top of the given remote version (last writer wins,
    /// explicitly chosen by the caller).
    Overwrite {
        /// The remote version the caller has reviewed.
        base_version: Version,
    },
}

/// Outcome of a transient failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Will be retried at the given time.
    RetryAt(Timestamp),
    /// Retry budget exhausted; the entry is now quarantined.
    GaveUp,
}

/// Ordered queue of unacknowledged mutations.
///
/// Entries flow through the queue in this order:
/// 1. `enqueue()` - append as `Pending`
/// 2. `mark_sending()` - a send is in flight
/// 3. `complete()` - acknowledged, removed; the entity's next entry is rebased
///
/// A failed send goes through `record_transient_failure()` (back to `Pending`
/// with a later `next_attempt_at`) or `quarantine()` (`Failed`, waits for
/// `resolve()`).
#[derive(Debug, Clone)]
pub struct MutationQueue {
    /// Maximum number of entries.
    max_size: usize,
    /// Entries keyed by sequence (enqueue order).
    entries: BTreeMap<u64, SyncQueueEntry>,
    /// Mutation id → sequence.
    index: HashMap<MutationId, u64>,
    /// Next sequence to hand out.
    next_sequence: u64,
}

impl MutationQueue {
    /// Create an empty queue with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_sequence: 1,
        }
    }

    /// Rebuild a queue from persisted entries.
    ///
    /// Entries left `Sending` by a crash go back to `Pending`: the send may or
    /// may not have reached the remote, and the idempotency key makes the
    /// resend safe either way. Returns the queue and the entries whose status
    /// was changed, so the caller can persist them.
    pub fn restore(max_size: usize, persisted: Vec<SyncQueueEntry>) -> (Self, Vec<SyncQueueEntry>) {
        let mut queue = Self::new(max_size);
        let mut reset = Vec::new();
        for mut entry in persisted {
            if entry.status == EntryStatus::Sending {
                entry.status = EntryStatus::Pending;
                reset.push(entry.clone());
            }
            queue.next_sequence = queue.next_sequence.max(entry.sequence.saturating_add(1));
            queue.index.insert(entry.id, entry.sequence);
            queue.entries.insert(entry.sequence, entry);
        }
        (queue, reset)
    }

    /// Append a new mutation.
    ///
    /// `cached_version` is the version of the entity in the local cache. If
    /// the entity already has queued entries, the new entry is chained behind
    /// them and its base version is fixed up when its predecessor completes.
    pub fn enqueue(
        &mut self,
        tenant_id: TenantId,
        operation: OperationType,
        entity: EntityKey,
        payload: Vec<u8>,
        cached_version: Option<Version>,
        now: Timestamp,
    ) -> Result<SyncQueueEntry, QueueStateError> {
        if self.entries.len() >= self.max_size {
            return Err(QueueStateError::Full {
                capacity: self.max_size,
            });
        }

        let base_version = match self.latest_for(&entity) {
            Some(previous) => previous.base_version,
            None => cached_version,
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let entry = SyncQueueEntry {
            id: MutationId::new(),
            tenant_id,
            operation,
            entity,
            payload,
            base_version,
            sequence,
            enqueued_at: now,
            source_origin: LOCAL_ORIGIN.to_string(),
            status: EntryStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: now,
        };
        self.index.insert(entry.id, sequence);
        self.entries.insert(sequence, entry.clone());
        Ok(entry)
    }

    /// Undo an `enqueue()` whose write to the local store failed.
    ///
    /// Only the latest entry of its entity can be withdrawn, and only while
    /// it is still `Pending`.
    pub fn withdraw(&mut self, id: &MutationId) -> Result<SyncQueueEntry, QueueStateError> {
        let entry = self.get(id).ok_or(QueueStateError::UnknownEntry(*id))?;
        let is_latest = self.latest_for(&entry.entity).map(|e| e.id) == Some(*id);
        if entry.status != EntryStatus::Pending || !is_latest {
            return Err(QueueStateError::InvalidStatus {
                id: *id,
                status: entry.status,
            });
        }
        self.remove(id)
    }

    /// Look up an entry.
    pub fn get(&self, id: &MutationId) -> Option<&SyncQueueEntry> {
        self.index.get(id).and_then(|seq| self.entries.get(seq))
    }

    /// The most recently enqueued entry for an entity.
    pub fn latest_for(&self, entity: &EntityKey) -> Option<&SyncQueueEntry> {
        self.entries.values().rev().find(|e| &e.entity == entity)
    }

    /// The oldest entry for an entity (the only one that may be sent).
    pub fn head_of(&self, entity: &EntityKey) -> Option<&SyncQueueEntry> {
        self.entries.values().find(|e| &e.entity == entity)
    }

    /// Entries that may be sent now, in enqueue order.
    ///
    /// Only the head of each entity is considered, and only if it is
    /// `Pending` and its backoff has elapsed.
    pub fn ready(&self, now: Timestamp) -> Vec<SyncQueueEntry> {
        self.heads()
            .into_iter()
            .filter(|e| e.status == EntryStatus::Pending && e.next_attempt_at <= now)
            .cloned()
            .collect()
    }

    /// Time until the earliest backing-off head becomes sendable.
    pub fn next_retry_in(&self, now: Timestamp) -> Option<Duration> {
        self.heads()
            .into_iter()
            .filter(|e| e.status == EntryStatus::Pending && e.next_attempt_at > now)
            .map(|e| Duration::from_millis(e.next_attempt_at - now))
            .min()
    }

    /// Mark an entry as in flight.
    pub fn mark_sending(&mut self, id: &MutationId) -> Result<SyncQueueEntry, QueueStateError> {
        let entry = self.entry_mut(id)?;
        if entry.status != EntryStatus::Pending {
            return Err(QueueStateError::InvalidStatus {
                id: *id,
                status: entry.status,
            });
        }
        entry.status = EntryStatus::Sending;
        Ok(entry.clone())
    }

    /// Remove an acknowledged entry.
    ///
    /// Returns the removed entry and, if the entity has a next entry, that
    /// entry rebased onto the acknowledged version.
    pub fn complete(
        &mut self,
        id: &MutationId,
        version: Version,
    ) -> Result<(SyncQueueEntry, Option<SyncQueueEntry>), QueueStateError> {
        let mut removed = self.remove(id)?;
        removed.status = EntryStatus::Completed;
        let successor = self.rebase_successor(&removed.entity, Some(version));
        Ok((removed, successor))
    }

    /// Record a transient failure (timeout, connection drop).
    ///
    /// After `max_retries` failures the entry is quarantined instead.
    pub fn record_transient_failure(
        &mut self,
        id: &MutationId,
        error: &str,
        delay: Duration,
        max_retries: u32,
        now: Timestamp,
    ) -> Result<(SyncQueueEntry, RetryDecision), QueueStateError> {
        let entry = self.entry_mut(id)?;
        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.last_error = Some(error.to_string());
        let decision = if entry.retry_count > max_retries {
            entry.status = EntryStatus::Failed;
            RetryDecision::GaveUp
        } else {
            entry.status = EntryStatus::Pending;
            entry.next_attempt_at = now.saturating_add(delay.as_millis() as u64);
            RetryDecision::RetryAt(entry.next_attempt_at)
        };
        Ok((entry.clone(), decision))
    }

    /// Quarantine an entry after a conflict or a permanent rejection.
    ///
    /// The entry stays in the queue, excluded from draining, and blocks only
    /// later entries of the same entity.
    pub fn quarantine(
        &mut self,
        id: &MutationId,
        error: &str,
    ) -> Result<SyncQueueEntry, QueueStateError> {
        let entry = self.entry_mut(id)?;
        entry.status = EntryStatus::Failed;
        entry.last_error = Some(error.to_string());
        Ok(entry.clone())
    }

    /// Apply a caller decision to a quarantined entry.
    ///
    /// Returns the entries whose stored form changed (the entry itself, or
    /// its rebased successor after a discard) and the discarded entry, if any.
    pub fn resolve(
        &mut self,
        id: &MutationId,
        resolution: Resolution,
        now: Timestamp,
    ) -> Result<Resolved, QueueStateError> {
        let status = self
            .get(id)
            .map(|e| e.status)
            .ok_or(QueueStateError::UnknownEntry(*id))?;
        if status != EntryStatus::Failed {
            return Err(QueueStateError::InvalidStatus { id: *id, status });
        }

        match resolution {
            Resolution::Discard => {
                let removed = self.remove(id)?;
                let successor = self.rebase_successor(&removed.entity, removed.base_version);
                Ok(Resolved {
                    updated: successor.into_iter().collect(),
                    discarded: Some(removed),
                })
            }
            Resolution::Retry | Resolution::Overwrite { .. } => {
                let entry = self.entry_mut(id)?;
                if let Resolution::Overwrite { base_version } = resolution {
                    entry.base_version = Some(base_version);
                }
                entry.status = EntryStatus::Pending;
                entry.retry_count = 0;
                entry.last_error = None;
                entry.next_attempt_at = now;
                Ok(Resolved {
                    updated: vec![entry.clone()],
                    discarded: None,
                })
            }
        }
    }

    /// Quarantined entries, in enqueue order.
    pub fn failed(&self) -> Vec<SyncQueueEntry> {
        self.entries
            .values()
            .filter(|e| e.is_failed())
            .cloned()
            .collect()
    }

    /// All entries, in enqueue order.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &SyncQueueEntry> {
        self.entries.values()
    }

    /// Number of entries (pending, sending and failed).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn heads(&self) -> Vec<&SyncQueueEntry> {
        let mut seen: HashSet<&EntityKey> = HashSet::new();
        let mut heads = Vec::new();
        for entry in self.entries.values() {
            if seen.insert(&entry.entity) {
                heads.push(entry);
            }
        }
        heads
    }

    fn entry_mut(&mut self, id: &MutationId) -> Result<&mut SyncQueueEntry, QueueStateError> {
        let seq = self
            .index
            .get(id)
            .copied()
            .ok_or(QueueStateError::UnknownEntry(*id))?;
        self.entries
            .get_mut(&seq)
            .ok_or(QueueStateError::UnknownEntry(*id))
    }

    fn remove(&mut self, id: &MutationId) -> Result<SyncQueueEntry, QueueStateError> {
        let seq = self
            .index
            .remove(id)
            .ok_or(QueueStateError::UnknownEntry(*id))?;
        self.entries
            .remove(&seq)
            .ok_or(QueueStateError::UnknownEntry(*id))
    }

    fn rebase_successor(
        &mut self,
        entity: &EntityKey,
        base_version: Option<Version>,
    ) -> Option<SyncQueueEntry> {
        let successor = self.entries.values_mut().find(|e| &e.entity == entity)?;
        successor.base_version = base_version;
        Some(successor.clone())
    }
}

/// Result of [`MutationQueue::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Entries whose stored form changed.
    pub updated: Vec<SyncQueueEntry>,
    /// The discarded entry, for `Resolution::Discard`.
    pub discarded: Option<SyncQueueEntry>,
}
