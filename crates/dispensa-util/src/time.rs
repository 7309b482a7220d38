//! Time utilities for dispensa
//!
//! Provides both monotonic time (for deadline enforcement) and wall-clock
//! time (for display and persistence), behind the [`Clock`] trait so the
//! session engine can run against a [`ManualClock`] in tests.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `DISPENSA_MOCK_TIME` environment variable can be set
//! to override the wall-clock time reported by [`now`] and [`SystemClock`].
//!
//! Format: `YYYY-MM-DD HH:MM:SS` (e.g., `2025-12-25 14:30:00`)
//!
//! Example:
//! ```bash
//! DISPENSA_MOCK_TIME="2025-12-25 14:30:00" ./dispensad
//! ```

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "DISPENSA_MOCK_TIME";

/// Format accepted by [`MOCK_TIME_ENV_VAR`]
pub const MOCK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Cached mock time offset from the real time when the process started.
/// This allows mock time to advance naturally.
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // wraps Local::now()
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            let mock_time_str = std::env::var(MOCK_TIME_ENV_VAR).ok()?;
            match parse_mock_time(&mock_time_str) {
                Some(mock_dt) => {
                    let offset = mock_dt.signed_duration_since(chrono::Local::now());
                    tracing::info!(
                        mock_time = %mock_time_str,
                        offset_secs = offset.num_seconds(),
                        "Mock time enabled"
                    );
                    Some(offset)
                }
                None => {
                    tracing::warn!(
                        mock_time = %mock_time_str,
                        expected_format = MOCK_TIME_FORMAT,
                        "Invalid mock time, using system time"
                    );
                    None
                }
            }
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Parse a mock time string in the local timezone.
pub fn parse_mock_time(s: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(s, MOCK_TIME_FORMAT).ok()?;
    Local.from_local_datetime(&naive).single()
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Get the current local time, respecting mock time settings in debug builds.
#[allow(clippy::disallowed_methods)] // the wrapper that provides mock time support
pub fn now() -> DateTime<Local> {
    let real_now = chrono::Local::now();

    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Format a DateTime for display with full date and time.
pub fn format_datetime_full(dt: &DateTime<Local>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Represents a point in monotonic time for deadline enforcement.
/// This is immune to wall-clock changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicInstant(Instant);

impl MonotonicInstant {
    pub fn now() -> Self {
        Self(Instant::now())
    }

    /// Duration since `earlier`, or zero if `earlier` is later than `self`
    pub fn duration_since(&self, earlier: MonotonicInstant) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    pub fn checked_add(&self, duration: Duration) -> Option<MonotonicInstant> {
        self.0.checked_add(duration).map(MonotonicInstant)
    }

    pub fn checked_sub(&self, duration: Duration) -> Option<MonotonicInstant> {
        self.0.checked_sub(duration).map(MonotonicInstant)
    }

    /// Returns duration until `self`, or zero if `self` is in the past
    pub fn saturating_duration_until(&self, from: MonotonicInstant) -> Duration {
        self.0.saturating_duration_since(from.0)
    }
}

impl std::ops::Add<Duration> for MonotonicInstant {
    type Output = MonotonicInstant;

    fn add(self, rhs: Duration) -> Self::Output {
        MonotonicInstant(self.0 + rhs)
    }
}

/// Source of time for the session engine.
///
/// Monotonic time drives deadlines; wall-clock time is only recorded for
/// display and persistence.
pub trait Clock: Send + Sync + 'static {
    fn now_mono(&self) -> MonotonicInstant;

    fn now_wall(&self) -> DateTime<Local>;
}

/// The real clock (wall time honors `DISPENSA_MOCK_TIME` in debug builds)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_mono(&self) -> MonotonicInstant {
        MonotonicInstant::now()
    }

    fn now_wall(&self) -> DateTime<Local> {
        now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base_mono: MonotonicInstant,
    base_wall: DateTime<Local>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(now())
    }

    pub fn starting_at(wall: DateTime<Local>) -> Self {
        Self {
            base_mono: MonotonicInstant::now(),
            base_wall: wall,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    /// Total time advanced since construction
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_mono(&self) -> MonotonicInstant {
        self.base_mono + self.elapsed()
    }

    fn now_wall(&self) -> DateTime<Local> {
        self.base_wall + to_chrono(self.elapsed())
    }
}

/// Longest duration budget a session may have
pub const MAX_DURATION_BUDGET: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Converts a std duration for wall-clock arithmetic, saturating on overflow
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Helper to format durations in human-readable form
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_monotonic_instant() {
        let t1 = MonotonicInstant::now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = MonotonicInstant::now();

        assert!(t2 > t1);
        assert!(t2.duration_since(t1) >= Duration::from_millis(10));
        assert_eq!(t1.duration_since(t2), Duration::ZERO);
    }

    #[test]
    fn test_saturating_duration_until() {
        let start = MonotonicInstant::now();
        let deadline = start + Duration::from_secs(300);

        assert_eq!(deadline.saturating_duration_until(start), Duration::from_secs(300));
        let late = start + Duration::from_secs(301);
        assert_eq!(deadline.saturating_duration_until(late), Duration::ZERO);
    }

    #[test]
    fn test_manual_clock_advances_both_clocks() {
        let wall = Local.with_ymd_and_hms(2025, 12, 25, 14, 30, 0).unwrap();
        let clock = ManualClock::starting_at(wall);
        let mono0 = clock.now_mono();

        // Standing still
        assert_eq!(clock.now_mono(), mono0);
        assert_eq!(clock.now_wall(), wall);

        clock.advance(Duration::from_secs(301));
        assert_eq!(clock.now_mono().duration_since(mono0), Duration::from_secs(301));
        assert_eq!(
            clock.now_wall(),
            Local.with_ymd_and_hms(2025, 12, 25, 14, 35, 1).unwrap()
        );
        assert_eq!(clock.elapsed(), Duration::from_secs(301));
    }

    #[test]
    fn test_format_datetime_full() {
        let dt = Local.with_ymd_and_hms(2025, 12, 25, 14, 30, 45).unwrap();
        assert_eq!(format_datetime_full(&dt), "2025-12-25 14:30:45");
    }

    #[test]
    fn test_now_returns_time() {
        let t = now();
        assert!(t.year() >= 2020);
        assert!(t.year() <= 2100);
    }

    #[test]
    fn test_parse_mock_time() {
        assert!(parse_mock_time("2025-12-25 14:30:00").is_some());
        assert!(parse_mock_time("2025-01-01 00:00:00").is_some());

        for invalid in ["2025-12-25", "14:30:00", "2025-12-25T14:30:00", "", "not a date"] {
            assert!(parse_mock_time(invalid).is_none(), "{invalid:?} should be rejected");
        }
    }

    #[test]
    fn test_mock_time_env_var_name() {
        assert_eq!(MOCK_TIME_ENV_VAR, "DISPENSA_MOCK_TIME");
        // Must not panic whether or not the variable is set
        let _ = is_mock_time_active();
    }

    #[test]
    fn test_to_chrono_saturates() {
        assert_eq!(to_chrono(Duration::from_secs(60)), chrono::Duration::seconds(60));
        assert_eq!(to_chrono(Duration::MAX), chrono::Duration::MAX);
    }
}
