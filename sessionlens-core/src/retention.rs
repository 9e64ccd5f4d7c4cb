//! Time-window retention shared by the console, network and replay channels

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Anything that carries the time it was recorded
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Maximum age an entry may reach before it is eligible for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow(Duration);

impl RetentionWindow {
    /// Default window of five minutes
    pub const DEFAULT_MINUTES: u64 = 5;

    /// Window of `minutes`, clamped to at least one minute
    pub fn from_minutes(minutes: u64) -> Self {
        let minutes = minutes.clamp(1, i64::MAX as u64 / 60_000);
        Self(Duration::minutes(minutes as i64))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Oldest timestamp still inside the window at `now`
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.0)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self::from_minutes(Self::DEFAULT_MINUTES)
    }
}

/// Drop entries older than `window` from the front of an insertion-ordered buffer.
///
/// Scans for the first entry at or after the cutoff and removes everything
/// before it. Entries after that point are kept even if a non-monotonic clock
/// made them older. When no entry is fresh enough the whole buffer is cleared.
///
/// Returns the number of entries removed.
pub fn prune_by_time<T: Timestamped>(
    buffer: &mut VecDeque<T>,
    window: RetentionWindow,
    now: DateTime<Utc>,
) -> usize {
    let cutoff = window.cutoff(now);
    match buffer.iter().position(|entry| entry.timestamp() >= cutoff) {
        Some(0) => 0,
        Some(first_fresh) => {
            buffer.drain(..first_fresh);
            first_fresh
        }
        None => {
            let removed = buffer.len();
            buffer.clear();
            removed
        }
    }
}
