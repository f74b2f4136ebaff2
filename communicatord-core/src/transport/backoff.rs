//! Reconnect backoff schedule for permanent stream connections (spec.md
//! §4.3, §4.9).
//!
//! Default schedule is `1,1,1,3,5,10,20,30,60` seconds, restarting from the
//! head on a full disconnect. `REFUSE{shutdown=true}` switches the next
//! delay to 5 minutes; a too-busy `REFUSE` switches it to 24 hours;
//! `conflict=name` stops reconnection altogether (handled by the caller,
//! not represented as a schedule state).

use std::time::Duration;

pub const DEFAULT_SCHEDULE_SECONDS: &[u64] = &[1, 1, 1, 3, 5, 10, 20, 30, 60];
pub const SHUTDOWN_DELAY: Duration = Duration::from_secs(5 * 60);
pub const TOO_BUSY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Cursor over a reconnect backoff schedule, plus the override delays used
/// for the shutdown/too-busy `REFUSE` cases (spec.md §4.9).
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
    cursor: usize,
    /// One-shot override for the next delay (shutdown / too-busy), consumed
    /// after a single use.
    override_delay: Option<Duration>,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEDULE_SECONDS.iter().map(|s| Duration::from_secs(*s)).collect())
    }
}

impl BackoffSchedule {
    pub fn new(steps: Vec<Duration>) -> Self {
        assert!(!steps.is_empty(), "backoff schedule must not be empty");
        Self {
            steps,
            cursor: 0,
            override_delay: None,
        }
    }

    /// Delay to wait before the next connection attempt.
    pub fn current_delay(&self) -> Duration {
        self.override_delay
            .unwrap_or_else(|| self.steps[self.cursor.min(self.steps.len() - 1)])
    }

    /// Record a failed attempt and advance the cursor, clearing any
    /// one-shot override (a fresh transient failure takes priority).
    pub fn record_failure(&mut self) {
        self.override_delay = None;
        if self.cursor + 1 < self.steps.len() {
            self.cursor += 1;
        }
    }

    /// A connection succeeded (or we are restarting after a full
    /// disconnect): restart from the head of the schedule.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.override_delay = None;
    }

    /// Peer replied `REFUSE{shutdown=true}`: wait 5 minutes before retrying.
    pub fn apply_shutdown_refusal(&mut self) {
        self.override_delay = Some(SHUTDOWN_DELAY);
    }

    /// Peer replied `REFUSE` for being too busy: wait 24 hours.
    pub fn apply_too_busy_refusal(&mut self) {
        self.override_delay = Some(TOO_BUSY_DELAY);
    }
}
