//! Per-parameter publish decision.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::PublishMode;

/// Publish history of one parameter.
#[derive(Debug, Clone, Default)]
pub struct PublishState {
    last_value: Option<f64>,
    last_published: Option<Instant>,
    last_read_ok: Option<Instant>,
}

impl PublishState {
    /// Decide whether a successful read of `value` at `now` is published.
    ///
    /// Records the value and instant when it is.
    pub fn evaluate(
        &mut self,
        mode: PublishMode,
        interval: Duration,
        value: f64,
        now: Instant,
    ) -> bool {
        self.last_read_ok = Some(now);

        let changed = self.last_value != Some(value);
        let elapsed = match self.last_published {
            Some(at) => now.saturating_duration_since(at) >= interval,
            None => true,
        };

        let due = match mode {
            PublishMode::OnChange => changed,
            PublishMode::Interval => elapsed,
            PublishMode::OnChangeAndInterval => changed || elapsed,
        };

        if due {
            self.mark_published(value, now);
        }
        due
    }

    /// Record an unconditional publish (recovery after silence).
    pub fn force(&mut self, value: f64, now: Instant) {
        self.last_read_ok = Some(now);
        self.mark_published(value, now);
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    pub fn last_read_ok(&self) -> Option<Instant> {
        self.last_read_ok
    }

    fn mark_published(&mut self, value: f64, now: Instant) {
        self.last_value = Some(value);
        self.last_published = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(10);

    #[test]
    fn test_on_change() {
        let now = Instant::now();
        let mut state = PublishState::default();

        assert!(state.evaluate(PublishMode::OnChange, T, 1.0, now));
        assert!(!state.evaluate(PublishMode::OnChange, T, 1.0, now + T));
        assert!(!state.evaluate(PublishMode::OnChange, T, 1.0, now + T * 5));
        assert!(state.evaluate(PublishMode::OnChange, T, 2.5, now + T * 6));
        assert_eq!(state.last_value(), Some(2.5));
    }

    #[test]
    fn test_interval() {
        let now = Instant::now();
        let mut state = PublishState::default();

        assert!(state.evaluate(PublishMode::Interval, T, 1.0, now));
        assert!(!state.evaluate(PublishMode::Interval, T, 2.0, now + Duration::from_secs(9)));
        assert!(state.evaluate(PublishMode::Interval, T, 2.0, now + T));
        assert!(!state.evaluate(
            PublishMode::Interval,
            T,
            3.0,
            now + T + Duration::from_secs(1)
        ));
    }

    #[test]
    fn test_zero_interval_publishes_every_read() {
        let now = Instant::now();
        let mut state = PublishState::default();

        for _ in 0..3 {
            assert!(state.evaluate(PublishMode::Interval, Duration::ZERO, 7.0, now));
        }
    }

    #[test]
    fn test_on_change_and_interval() {
        let now = Instant::now();
        let mut state = PublishState::default();
        let mode = PublishMode::OnChangeAndInterval;

        assert!(state.evaluate(mode, T, 1.0, now));
        assert!(!state.evaluate(mode, T, 1.0, now + Duration::from_secs(1)));
        assert!(state.evaluate(mode, T, 2.0, now + Duration::from_secs(2)));
        assert!(state.evaluate(mode, T, 2.0, now + Duration::from_secs(12)));
    }

    #[test]
    fn test_force_counts_as_publish() {
        let now = Instant::now();
        let mut state = PublishState::default();

        state.force(4.0, now);
        assert_eq!(state.last_read_ok(), Some(now));
        assert!(!state.evaluate(PublishMode::OnChange, T, 4.0, now + T));
        assert!(!state.evaluate(PublishMode::Interval, T, 4.0, now + Duration::from_secs(1)));
    }
}
