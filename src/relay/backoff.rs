//! Reconnect delay policy for the tunnel.

use std::time::Duration;

/// A connection that stayed up this long is considered to have been healthy.
pub const STABLE_THRESHOLD: Duration = Duration::from_secs(60);

const FLOOR: Duration = Duration::from_secs(1);
const CEILING: Duration = Duration::from_secs(10);

/// Exponential backoff, reset by a stable run.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(FLOOR, CEILING)
    }
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            current: floor,
            floor,
            ceiling,
        }
    }

    /// Delay before the next attempt, given how long the failed one ran.
    ///
    /// `None` means reconnect immediately: the attempt was stable, so the
    /// delay is reset to the floor.
    pub fn after_failure(&mut self, ran_for: Duration) -> Option<Duration> {
        if ran_for >= STABLE_THRESHOLD {
            self.current = self.floor;
            return None;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        Some(delay)
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
