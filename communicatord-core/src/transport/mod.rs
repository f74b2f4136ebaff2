//! Transport layer: stream (TCP/Unix, plain or TLS) and datagram (UDP)
//! connection primitives (spec.md §4.3).

pub mod backoff;
pub mod datagram;
pub mod stream;
pub mod tls;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::message::{Message, MessageError};
use crate::registry::{Direction, Role};

/// A freshly accepted or dialed connection, not yet admitted into the
/// registry. Produced by a listener's accept loop (owned by the
/// `communicatord` binary, spec.md §1) and consumed by the broker's event
/// loop, which is the only place allowed to mutate the registry.
pub struct PendingConnection {
    pub raw: stream::RawStream,
    pub peer_address: Option<SocketAddr>,
    pub direction: Direction,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("message framing error: {0}")]
    Framing(#[from] MessageError),
    #[error("connection closed")]
    Closed,
    #[error("datagram dropped: {0}")]
    DatagramDropped(&'static str),
}

/// Event surfaced by a connection's background reader/driver task, matching
/// the lifecycle callbacks of spec.md §4.3 (`on-connected`, `on-message`,
/// `on-error`, `on-hangup`, `on-invalid`). `ConnectionFailed` is specific to
/// permanent (reconnecting) connections between attempts.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    Message(Message),
    Error(TransportError),
    Hangup,
    Invalid(MessageError),
    ConnectionFailed(String),
}

/// Options shared by stream and datagram transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub timeout: Option<Duration>,
    pub max_message_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            max_message_size: 1024 * 1024,
        }
    }
}

/// Tracks consecutive connection failures for a single peer, raising the
/// persistent flag described in spec.md §4.9 ("after 20 consecutive
/// failures over >1 h, raise `remote-connection/connection-failed` with
/// priority 95"). This type only tracks the counter/window; actually
/// writing the flag is the flag-file tool's job (spec.md §1, out of core
/// scope) — the broker observes `should_raise_flag()` and hands off.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    count: u32,
    window_start: Option<Instant>,
    flag_raised: bool,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self {
            count: 0,
            window_start: None,
            flag_raised: false,
        }
    }
}

impl FailureTracker {
    pub const FAILURE_THRESHOLD: u32 = 20;
    pub const WINDOW: Duration = Duration::from_secs(60 * 60);

    pub fn record_failure(&mut self, now: Instant) {
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.count += 1;
    }

    pub fn record_success(&mut self) {
        self.count = 0;
        self.window_start = None;
        self.flag_raised = false;
    }

    /// True exactly once per qualifying window: at least
    /// [`FAILURE_THRESHOLD`] failures spanning more than [`WINDOW`].
    pub fn should_raise_flag(&mut self, now: Instant) -> bool {
        if self.flag_raised {
            return false;
        }
        let qualifies = self.count >= Self::FAILURE_THRESHOLD
            && self
                .window_start
                .map(|start| now.duration_since(start) > Self::WINDOW)
                .unwrap_or(false);
        if qualifies {
            self.flag_raised = true;
        }
        qualifies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raises_flag_after_threshold_over_window() {
        let mut tracker = FailureTracker::default();
        let start = Instant::now();
        for _ in 0..FailureTracker::FAILURE_THRESHOLD {
            tracker.record_failure(start);
        }
        assert!(!tracker.should_raise_flag(start));
        let later = start + FailureTracker::WINDOW + Duration::from_secs(1);
        assert!(tracker.should_raise_flag(later));
        // only raised once until a success resets it
        assert!(!tracker.should_raise_flag(later));
    }

    #[test]
    fn success_resets_the_tracker() {
        let mut tracker = FailureTracker::default();
        let start = Instant::now();
        for _ in 0..FailureTracker::FAILURE_THRESHOLD {
            tracker.record_failure(start);
        }
        tracker.record_success();
        let later = start + FailureTracker::WINDOW + Duration::from_secs(1);
        assert!(!tracker.should_raise_flag(later));
    }
}
