//! Silence detection for nodes and parameters.

use std::time::Duration;

use rtugate_common::StatusCode;
use tokio::time::Instant;

use crate::config::{HeartbeatScope, LineSettings};

/// When and how often silent parameters are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub scope: HeartbeatScope,
    pub silence_after: Duration,
    pub repeat: Duration,
}

impl HeartbeatPolicy {
    pub fn from_settings(settings: &LineSettings) -> Self {
        Self {
            scope: settings.heartbeat.scope,
            silence_after: settings.silence_after(),
            repeat: settings.heartbeat_repeat(),
        }
    }
}

/// A synthetic "no data" event for one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SilentEvent {
    /// Parameter index within the node.
    pub param: usize,
    pub silent_for: Duration,
    pub message: String,
}

#[derive(Debug, Clone)]
struct Tracker {
    last_ok: Instant,
    last_emit: Option<Instant>,
    last_error: Option<String>,
}

/// Silence timers of one node.
///
/// With [`HeartbeatScope::Param`] every parameter has its own timer, with
/// [`HeartbeatScope::Node`] a single timer is shared by all of them.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    policy: HeartbeatPolicy,
    trackers: Vec<Tracker>,
    /// Parameters that were reported silent and have not read successfully since.
    pending_recovery: Vec<bool>,
}

impl HeartbeatMonitor {
    /// Timers start at `start`, so a node that never answers goes silent
    /// `silence_after` later.
    pub fn new(policy: HeartbeatPolicy, params: usize, start: Instant) -> Self {
        let count = match policy.scope {
            HeartbeatScope::Param => params,
            HeartbeatScope::Node => params.min(1),
        };
        let tracker = Tracker {
            last_ok: start,
            last_emit: None,
            last_error: None,
        };
        Self {
            policy,
            trackers: vec![tracker; count],
            pending_recovery: vec![false; params],
        }
    }

    fn tracker_of(&self, param: usize) -> usize {
        match self.policy.scope {
            HeartbeatScope::Param => param,
            HeartbeatScope::Node => 0,
        }
    }

    /// A successful read of `param`.
    ///
    /// Returns `true` when the parameter was reported silent before, in which
    /// case the value must be published regardless of its publish mode.
    pub fn record_success(&mut self, param: usize, now: Instant) -> bool {
        let t = self.tracker_of(param);
        if let Some(tracker) = self.trackers.get_mut(t) {
            tracker.last_ok = now;
            tracker.last_emit = None;
            tracker.last_error = None;
        }
        self.pending_recovery
            .get_mut(param)
            .map(std::mem::take)
            .unwrap_or(false)
    }

    /// A failed read of `param`.
    pub fn record_failure(&mut self, param: usize, status: StatusCode, message: &str) {
        let t = self.tracker_of(param);
        if let Some(tracker) = self.trackers.get_mut(t) {
            tracker.last_error = Some(format!("{}: {}", status, message));
        }
    }

    /// Silence of `param` at `now`.
    pub fn silence(&self, param: usize, now: Instant) -> Duration {
        self.trackers
            .get(self.tracker_of(param))
            .map(|t| now.saturating_duration_since(t.last_ok))
            .unwrap_or_default()
    }

    /// Heartbeat events due at `now`, one per affected parameter.
    pub fn due(&mut self, now: Instant) -> Vec<SilentEvent> {
        let mut events = Vec::new();

        for t in 0..self.trackers.len() {
            let tracker = &mut self.trackers[t];
            let silence = now.saturating_duration_since(tracker.last_ok);
            if silence < self.policy.silence_after {
                continue;
            }
            let repeat_due = tracker
                .last_emit
                .is_none_or(|at| now.saturating_duration_since(at) >= self.policy.repeat);
            if !repeat_due {
                continue;
            }
            tracker.last_emit = Some(now);

            let message = tracker
                .last_error
                .clone()
                .unwrap_or_else(|| "no successful read".to_string());

            let params = match self.policy.scope {
                HeartbeatScope::Param => t..t + 1,
                HeartbeatScope::Node => 0..self.pending_recovery.len(),
            };
            for param in params {
                self.pending_recovery[param] = true;
                events.push(SilentEvent {
                    param,
                    silent_for: silence,
                    message: message.clone(),
                });
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(scope: HeartbeatScope, silence_ms: u64, repeat_ms: u64) -> HeartbeatPolicy {
        HeartbeatPolicy {
            scope,
            silence_after: Duration::from_millis(silence_ms),
            repeat: Duration::from_millis(repeat_ms),
        }
    }

    #[test]
    fn test_silence_grows_and_repeats() {
        let start = Instant::now();
        let mut hb = HeartbeatMonitor::new(policy(HeartbeatScope::Param, 1000, 1000), 1, start);
        hb.record_failure(0, StatusCode::Timeout, "no response");

        assert!(hb.due(start + Duration::from_millis(500)).is_empty());

        let first = hb.due(start + Duration::from_millis(1000));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].silent_for, Duration::from_millis(1000));
        assert_eq!(first[0].message, "TIMEOUT: no response");

        assert!(hb.due(start + Duration::from_millis(1500)).is_empty());

        let mut last = first[0].silent_for;
        for s in 2..6 {
            let events = hb.due(start + Duration::from_secs(s));
            assert_eq!(events.len(), 1);
            assert!(events[0].silent_for >= last);
            last = events[0].silent_for;
        }
        assert_eq!(last, Duration::from_secs(5));
    }

    #[test]
    fn test_success_resets_and_flags_recovery() {
        let start = Instant::now();
        let mut hb = HeartbeatMonitor::new(policy(HeartbeatScope::Param, 1000, 500), 2, start);

        let at = start + Duration::from_secs(2);
        assert_eq!(hb.due(at).len(), 2);
        assert!(hb.due(at).is_empty());

        assert!(hb.record_success(0, at));
        assert!(!hb.record_success(0, at));
        assert_eq!(hb.silence(0, at), Duration::ZERO);

        let later = at + Duration::from_millis(500);
        let events = hb.due(later);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].param, 1);
        assert_eq!(events[0].message, "no successful read");
    }

    #[test]
    fn test_node_scope_shares_timer() {
        let start = Instant::now();
        let mut hb = HeartbeatMonitor::new(policy(HeartbeatScope::Node, 1000, 1000), 3, start);

        // A single healthy parameter keeps the whole node alive.
        hb.record_success(2, start + Duration::from_millis(900));
        assert!(hb.due(start + Duration::from_millis(1500)).is_empty());

        let events = hb.due(start + Duration::from_millis(1900));
        assert_eq!(events.len(), 3);
        assert!(
            events
                .iter()
                .all(|e| e.silent_for == Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_repeat_slower_than_threshold() {
        let start = Instant::now();
        let mut hb = HeartbeatMonitor::new(policy(HeartbeatScope::Param, 1000, 3000), 1, start);

        assert_eq!(hb.due(start + Duration::from_secs(1)).len(), 1);
        assert!(hb.due(start + Duration::from_secs(2)).is_empty());
        assert!(hb.due(start + Duration::from_secs(3)).is_empty());
        assert_eq!(hb.due(start + Duration::from_secs(4)).len(), 1);
    }
}
