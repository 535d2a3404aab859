//! Node fault backoff and serial port retry state.

use std::time::Duration;

use tokio::time::Instant;

/// Consecutive-failure counter of one node.
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    errors: u32,
    until: Option<Instant>,
}

impl BackoffState {
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// The node must not be polled at `now`.
    pub fn should_skip(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| now < until)
    }

    /// A cycle with at least one successful request.
    pub fn record_success(&mut self) {
        self.errors = 0;
        self.until = None;
    }

    /// A cycle where every request failed.
    ///
    /// Returns `true` when this failure starts a backoff period.
    pub fn record_failure(&mut self, now: Instant, threshold: u32, backoff: Duration) -> bool {
        self.errors = self.errors.saturating_add(1);
        if threshold == 0 || self.errors < threshold {
            return false;
        }
        self.until = Some(now + backoff);
        true
    }
}

/// Open/closed state of a line's serial port.
#[derive(Debug, Clone, Default)]
pub struct PortState {
    open: bool,
    retry_at: Option<Instant>,
}

impl PortState {
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// An open attempt is allowed at `now`.
    pub fn can_open(&self, now: Instant) -> bool {
        !self.open && self.retry_at.is_none_or(|at| now >= at)
    }

    pub fn opened(&mut self) {
        self.open = true;
        self.retry_at = None;
    }

    /// The port failed to open or broke; wait `retry` before reopening.
    pub fn failed(&mut self, now: Instant, retry: Duration) {
        self.open = false;
        self.retry_at = Some(now + retry);
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }
}
