//! # sync-core
//!
//! Pure logic for offsync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms of the sync core
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input (including the
//! current time) and produce output without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, disk) is performed by `sync-client`, which
//! persists the changes and interprets the actions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod advisory;
pub mod backoff;
pub mod connection;
pub mod lease;
pub mod lifecycle;
pub mod merge;
pub mod queue;
pub mod schema;

pub use advisory::OfflineLockTable;
pub use backoff::Backoff;
pub use connection::{ConnectionState, ConnectivityTracker, ProbeOutcome, Transition};
pub use lease::{LeaseError, LeaseKey, LeaseTable, LockEvent, LockPhase};
pub use lifecycle::{Action, Event, Notice, SyncPhase};
pub use merge::{decide, normalize, MergeDecision, SequenceTracker};
pub use queue::{MutationQueue, QueueStateError, Resolution, Resolved, RetryDecision};
pub use schema::{plan_migrations, SchemaPlanError, BASELINE_VERSION};
