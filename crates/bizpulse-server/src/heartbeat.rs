//! Ping/pong liveness tracking.

use std::time::Duration;

/// What the writer should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Peer still counts as alive; send another ping.
    Ping,
    /// Peer missed too many ticks; close the connection.
    TimedOut,
}

/// Missed-tick counter for one connection.
///
/// At each `interval` tick the caller reports whether the peer was heard
/// from since the previous tick. After `timeout / interval` consecutive
/// silent ticks (at least 1) the connection is considered dead.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    max_missed: u32,
    missed: u32,
}

impl Heartbeat {
    /// A zero `interval` is raised to one millisecond; `tokio::time::interval`
    /// panics on zero.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let max_missed = u32::try_from(timeout.as_millis() / interval.as_millis())
            .unwrap_or(u32::MAX)
            .max(1);
        Self {
            interval,
            max_missed,
            missed: 0,
        }
    }

    pub fn from_secs(interval_secs: u64, timeout_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(interval_secs),
            Duration::from_secs(timeout_secs),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_missed(&self) -> u32 {
        self.max_missed
    }

    pub fn on_tick(&mut self, heard_since_last_tick: bool) -> Beat {
        if heard_since_last_tick {
            self.missed = 0;
            return Beat::Ping;
        }
        self.missed += 1;
        if self.missed >= self.max_missed {
            Beat::TimedOut
        } else {
            Beat::Ping
        }
    }
}
