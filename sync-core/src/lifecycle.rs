//! Reconnect lifecycle state machine for offsync.
//!
//! This module provides a pure, side-effect-free state machine for the
//! sequence that runs every time the device comes back online:
//! schema check → queue drain → lock reconciliation → steady state.
//! It takes events as input and produces a new phase plus a list of actions.
//!
//! The actual I/O (probing, migrating, sending) is performed by the engine in
//! sync-client, which interprets the returned actions. A single driver feeds
//! every event through [`SyncPhase::on_event`], so the ordering
//! "schema before drain before lock reconciliation" lives in one place.

use std::time::Duration;

/// Where the device is in the reconnect sequence - NO I/O, just transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// Not online; mutations accumulate in the queue.
    #[default]
    Disconnected,
    /// Online, verifying/migrating the local schema. Draining is not allowed.
    SchemaChecking {
        /// Number of failed schema checks in this reconnect so far.
        attempt: u32,
    },
    /// Sending queued mutations.
    Draining {
        /// This drain is part of the reconnect sequence (locks not yet reconciled).
        after_reconnect: bool,
        /// Another drain was requested while this one ran.
        rerun: bool,
    },
    /// Promoting or discarding offline locks.
    LockReconciling {
        /// A drain was requested while reconciling.
        rerun: bool,
    },
    /// Online and caught up; new mutations drain as they arrive.
    Steady,
    /// A fatal error stopped the driver. Terminal.
    Halted {
        /// What went wrong.
        reason: String,
    },
}

impl SyncPhase {
    /// Create a new state machine in the Disconnected phase.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new phase plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event) -> (Self, Vec<Action>) {
        match (self, event) {
            // Halted absorbs everything
            (halted @ Self::Halted { .. }, _) => (halted, vec![]),

            // Fatal from anywhere
            (_, Event::Fatal { reason }) => (
                Self::Halted {
                    reason: reason.clone(),
                },
                vec![Action::Emit(Notice::Halted { reason })],
            ),

            // Losing connectivity resets the pipeline
            (Self::Disconnected, Event::WentOffline) => (Self::Disconnected, vec![]),
            (_, Event::WentOffline) => (
                Self::Disconnected,
                vec![
                    Action::CloseSchemaGate,
                    Action::ExpireHeldLocks,
                    Action::Emit(Notice::Offline),
                ],
            ),

            // From Disconnected
            (Self::Disconnected, Event::WentOnline) => (
                Self::SchemaChecking { attempt: 0 },
                vec![Action::Emit(Notice::Online), Action::CheckSchema],
            ),

            // From SchemaChecking
            (Self::SchemaChecking { .. }, Event::SchemaReady) => (
                Self::Draining {
                    after_reconnect: true,
                    rerun: false,
                },
                vec![Action::DrainQueue],
            ),
            (Self::SchemaChecking { attempt }, Event::SchemaFailed { error }) => {
                let next_attempt = attempt.saturating_add(1);
                (
                    Self::SchemaChecking {
                        attempt: next_attempt,
                    },
                    vec![
                        Action::Emit(Notice::SchemaCheckFailed {
                            attempt: next_attempt,
                            error,
                        }),
                        Action::ScheduleSchemaRetry {
                            attempt: next_attempt,
                        },
                    ],
                )
            }
            (state @ Self::SchemaChecking { .. }, Event::SchemaRetryTimer) => {
                (state, vec![Action::CheckSchema])
            }

            // From Draining
            (
                Self::Draining {
                    after_reconnect,
                    rerun,
                },
                Event::DrainFinished { retry_in },
            ) => {
                let mut actions = Vec::new();
                if let Some(delay) = retry_in {
                    actions.push(Action::ScheduleDrain { delay });
                }
                if after_reconnect {
                    actions.push(Action::ReconcileLocks);
                    (Self::LockReconciling { rerun }, actions)
                } else if rerun {
                    actions.push(Action::DrainQueue);
                    (
                        Self::Draining {
                            after_reconnect: false,
                            rerun: false,
                        },
                        actions,
                    )
                } else {
                    (Self::Steady, actions)
                }
            }
            (Self::Draining { .. }, Event::DrainAborted) => (Self::Disconnected, vec![]),
            (
                Self::Draining {
                    after_reconnect, ..
                },
                Event::MutationEnqueued | Event::DrainTimer,
            ) => (
                Self::Draining {
                    after_reconnect,
                    rerun: true,
                },
                vec![],
            ),

            // From LockReconciling
            (Self::LockReconciling { rerun }, Event::LocksReconciled) => {
                let mut actions = vec![Action::ResyncChanges, Action::Emit(Notice::Synced)];
                if rerun {
                    actions.push(Action::DrainQueue);
                    (
                        Self::Draining {
                            after_reconnect: false,
                            rerun: false,
                        },
                        actions,
                    )
                } else {
                    (Self::Steady, actions)
                }
            }
            (Self::LockReconciling { .. }, Event::MutationEnqueued | Event::DrainTimer) => {
                (Self::LockReconciling { rerun: true }, vec![])
            }

            // From Steady
            (Self::Steady, Event::MutationEnqueued | Event::DrainTimer) => (
                Self::Draining {
                    after_reconnect: false,
                    rerun: false,
                },
                vec![Action::DrainQueue],
            ),

            // Invalid transitions - stay in current phase
            (state, _) => (state, vec![]),
        }
    }

    /// Whether the sequence has reached the steady state.
    pub fn is_steady(&self) -> bool {
        matches!(self, Self::Steady)
    }

    /// Whether the driver stopped on a fatal error.
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted { .. })
    }
}

/// Events that drive the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connection monitor reported a transition into Online.
    WentOnline,
    /// Connection monitor reported a transition into Offline.
    WentOffline,
    /// Local schema matches the remote (migrations applied).
    SchemaReady,
    /// Schema check failed transiently.
    SchemaFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Schema retry timer fired.
    SchemaRetryTimer,
    /// Drain pass finished.
    DrainFinished {
        /// Earliest time a backing-off entry becomes sendable, if any.
        retry_in: Option<Duration>,
    },
    /// Drain pass stopped because connectivity was lost.
    DrainAborted,
    /// Offline lock reconciliation finished.
    LocksReconciled,
    /// The caller enqueued a mutation.
    MutationEnqueued,
    /// Drain retry timer fired.
    DrainTimer,
    /// Unrecoverable error (local store corruption, migration failure).
    Fatal {
        /// Error message describing the failure.
        reason: String,
    },
}

/// Actions to be executed by the engine.
///
/// These are instructions, not side effects. The engine interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Fetch the remote schema version and migrate the local store.
    CheckSchema,
    /// Start a timer that produces [`Event::SchemaRetryTimer`].
    ScheduleSchemaRetry {
        /// Which retry this is (drives the backoff delay).
        attempt: u32,
    },
    /// Close the schema gate so no drain can start.
    CloseSchemaGate,
    /// Run one drain pass of the sync queue.
    DrainQueue,
    /// Start a timer that produces [`Event::DrainTimer`].
    ScheduleDrain {
        /// Delay before the next drain pass.
        delay: Duration,
    },
    /// Reconcile offline locks against the remote lock table.
    ReconcileLocks,
    /// Treat every held record lock as expired (holder disconnected).
    ExpireHeldLocks,
    /// Ask the realtime handler to pull missed changes.
    ResyncChanges,
    /// Emit a notice to the application.
    Emit(Notice),
}

/// Lifecycle notices emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Device came online; reconnect sequence started.
    Online,
    /// Device went offline.
    Offline,
    /// Reconnect sequence finished.
    Synced,
    /// A schema check failed and will be retried.
    SchemaCheckFailed {
        /// Which attempt failed.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// The driver stopped.
    Halted {
        /// What went wrong.
        reason: String,
    },
}
