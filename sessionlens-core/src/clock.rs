//! Entry identifiers and wall-clock timestamps
//!
//! Every recorded entry gets a process-unique id from [`new_id`] and a
//! timestamp from a [`Clock`]. Channels hold the clock behind an `Arc` so
//! tests can drive retention with a [`ManualClock`].

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::fmt::Debug;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared clock handle passed to every channel
pub type SharedClock = Arc<dyn Clock>;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync + Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Current time as an ISO-8601 string with millisecond precision
    fn now_iso(&self) -> String {
        to_iso(self.now())
    }
}

/// Format a timestamp the way reports carry it (`2024-05-01T10:00:00.000Z`)
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serde adapter writing timestamps with [`to_iso`]
pub mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_iso(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute time (may move backwards)
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a collision-resistant identifier.
///
/// Uses OS entropy to build a version 4 UUID. When the entropy source is
/// unavailable the id degrades to `<unix millis>-fallback-<suffix>`, where the
/// suffix mixes a per-process counter through a randomly keyed hasher. This
/// never fails.
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "entropy source unavailable, using fallback id");
            fallback_id()
        }
    }
}

fn fallback_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let sequence = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = RandomState::new().hash_one((millis, sequence));
    format!("{millis}-fallback-{:010x}", mixed & 0xff_ffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<String> = (0..1_000).map(|_| new_id()).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[test]
    fn test_id_is_uuid_v4() {
        let id = new_id();
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_fallback_ids_are_unique() {
        let a = fallback_id();
        let b = fallback_id();
        assert_ne!(a, b);
        assert!(a.contains("-fallback-"));
    }

    #[test]
    fn test_iso_format_has_millis_and_zulu() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(to_iso(ts), "2024-05-01T10:00:00.000Z");
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
        assert_eq!(clock.now_iso(), "2024-05-01T10:01:30.000Z");
    }
}
