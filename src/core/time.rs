//! Shared timestamp and identifier helpers.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use ulid::Ulid;

/// Returns unix-epoch milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Entity id with a readable prefix, e.g. `artifact_01J...`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// UTC calendar day (`YYYY-MM-DD`) containing `ts_ms`.
pub fn day_key(ts_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms as i64)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

/// Start of a `YYYY-MM-DD` day in epoch millis, or `None` if it does not parse.
pub fn day_start_ms(day: &str) -> Option<u64> {
    let date = NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
    let ts = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    u64::try_from(ts).ok()
}

/// Time source. Tests pin time with [`FixedClock`].
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

#[derive(Debug, Default)]
pub struct FixedClock(AtomicU64);

impl FixedClock {
    pub fn new(ts_ms: u64) -> Self {
        Self(AtomicU64::new(ts_ms))
    }

    pub fn set(&self, ts_ms: u64) {
        self.0.store(ts_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_key_is_utc_calendar_day() {
        // 2026-01-02T03:04:05Z
        assert_eq!(day_key(1_767_323_045_000), "2026-01-02");
        assert_eq!(day_key(0), "1970-01-01");
    }

    #[test]
    fn day_start_round_trips_day_key() {
        let start = day_start_ms("2026-01-02").unwrap();
        assert_eq!(day_key(start), "2026-01-02");
        assert_eq!(day_key(start - 1), "2026-01-01");
        assert!(day_start_ms("not-a-day").is_none());
    }

    #[test]
    fn new_id_is_prefixed_and_unique() {
        let a = new_id("model");
        let b = new_id("model");
        assert!(a.starts_with("model_"));
        assert_ne!(a, b);
        assert!(Ulid::from_string(a.trim_start_matches("model_")).is_ok());
    }

    #[test]
    fn fixed_clock_moves_only_when_told() {
        let clock = FixedClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
