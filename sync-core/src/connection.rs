//! Connectivity tracking - NO I/O.
//!
//! [`ConnectivityTracker`] turns a stream of health probe outcomes into
//! connection state transitions. The probing itself happens in sync-client's
//! connection monitor; this module only decides when a transition happened,
//! so that each transition is reported exactly once.

/// Process-wide connectivity as seen by this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// The remote store answered the last probe.
    Online,
    /// The remote store is considered unreachable.
    #[default]
    Offline,
    /// A probe failed while online; not yet declared offline.
    Reconnecting,
}

impl ConnectionState {
    /// Only `Online` lets the queue drain and locks be acquired remotely.
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Result of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The health endpoint answered in time.
    Reachable,
    /// The probe failed or timed out.
    Unreachable,
}

/// A change of [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the probe.
    pub from: ConnectionState,
    /// State after the probe.
    pub to: ConnectionState,
}

impl Transition {
    /// The transition entered `Online`.
    pub fn went_online(&self) -> bool {
        self.to == ConnectionState::Online
    }

    /// The transition entered `Offline`.
    pub fn went_offline(&self) -> bool {
        self.to == ConnectionState::Offline
    }
}

/// Folds probe outcomes into a connection state.
///
/// Starts `Offline`, so the first successful probe reports a transition to
/// `Online` and kicks off the reconnect pipeline.
#[derive(Debug, Clone)]
pub struct ConnectivityTracker {
    state: ConnectionState,
    consecutive_failures: u32,
    failures_before_offline: u32,
}

impl ConnectivityTracker {
    /// Create a tracker. `failures_before_offline` is clamped to at least 1.
    pub fn new(failures_before_offline: u32) -> Self {
        Self {
            state: ConnectionState::Offline,
            consecutive_failures: 0,
            failures_before_offline: failures_before_offline.max(1),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Record a probe outcome. Returns the transition, if the state changed.
    pub fn observe(&mut self, outcome: ProbeOutcome) -> Option<Transition> {
        let next = match outcome {
            ProbeOutcome::Reachable => {
                self.consecutive_failures = 0;
                ConnectionState::Online
            }
            ProbeOutcome::Unreachable => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                match self.state {
                    ConnectionState::Offline => ConnectionState::Offline,
                    _ if self.consecutive_failures >= self.failures_before_offline => {
                        ConnectionState::Offline
                    }
                    _ => ConnectionState::Reconnecting,
                }
            }
        };

        if next == self.state {
            return None;
        }
        let transition = Transition {
            from: self.state,
            to: next,
        };
        self.state = next;
        Some(transition)
    }
}

impl Default for ConnectivityTracker {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_offline() {
        let tracker = ConnectivityTracker::default();
        assert_eq!(tracker.state(), ConnectionState::Offline);
    }

    #[test]
    fn first_success_goes_online() {
        let mut tracker = ConnectivityTracker::default();
        let transition = tracker.observe(ProbeOutcome::Reachable).unwrap();
        assert!(transition.went_online());
        assert_eq!(transition.from, ConnectionState::Offline);
    }

    #[test]
    fn repeated_success_reports_nothing() {
        let mut tracker = ConnectivityTracker::default();
        tracker.observe(ProbeOutcome::Reachable);
        assert!(tracker.observe(ProbeOutcome::Reachable).is_none());
        assert!(tracker.observe(ProbeOutcome::Reachable).is_none());
    }

    #[test]
    fn single_failure_while_online_is_reconnecting() {
        let mut tracker = ConnectivityTracker::new(2);
        tracker.observe(ProbeOutcome::Reachable);

        let transition = tracker.observe(ProbeOutcome::Unreachable).unwrap();
        assert_eq!(transition.to, ConnectionState::Reconnecting);
        assert!(!transition.went_offline());
        assert!(!tracker.state().is_online());
    }

    #[test]
    fn threshold_failures_go_offline_once() {
        let mut tracker = ConnectivityTracker::new(2);
        tracker.observe(ProbeOutcome::Reachable);
        tracker.observe(ProbeOutcome::Unreachable);

        let transition = tracker.observe(ProbeOutcome::Unreachable).unwrap();
        assert!(transition.went_offline());
        assert!(tracker.observe(ProbeOutcome::Unreachable).is_none());
    }

    #[test]
    fn threshold_of_one_skips_reconnecting() {
        let mut tracker = ConnectivityTracker::new(1);
        tracker.observe(ProbeOutcome::Reachable);
        let transition = tracker.observe(ProbeOutcome::Unreachable).unwrap();
        assert!(transition.went_offline());
    }

    #[test]
    fn recovery_from_reconnecting_goes_online() {
        let mut tracker = ConnectivityTracker::new(3);
        tracker.observe(ProbeOutcome::Reachable);
        tracker.observe(ProbeOutcome::Unreachable);

        let transition = tracker.observe(ProbeOutcome::Reachable).unwrap();
        assert_eq!(transition.from, ConnectionState::Reconnecting);
        assert!(transition.went_online());
    }

    #[test]
    fn failures_reset_after_success() {
        let mut tracker = ConnectivityTracker::new(2);
        tracker.observe(ProbeOutcome::Reachable);
        tracker.observe(ProbeOutcome::Unreachable);
        tracker.observe(ProbeOutcome::Reachable);

        // Counter was reset, so one failure only reaches Reconnecting again
        let transition = tracker.observe(ProbeOutcome::Unreachable).unwrap();
        assert_eq!(transition.to, ConnectionState::Reconnecting);
    }
}
