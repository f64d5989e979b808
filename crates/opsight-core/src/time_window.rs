//! Time window resolution and validation.
//!
//! Every data fetch in opsight is bounded by a `(start, end)` pair. The
//! [`TimeWindowResolver`] turns "the last two hours" or explicit bounds into
//! such a pair, rejects windows that are inverted, in the future, or wider
//! than [`MAX_WINDOW_DAYS`], and renders the bounds in each backend's
//! format:
//!
//! | Backend | Format |
//! |---------|--------|
//! | metrics | `f64` epoch seconds |
//! | Loki    | nanosecond epoch strings |
//! | humans  | `"last 15 minutes"` |

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::InvalidRange;

/// Widest window any backend is asked for.
pub const MAX_WINDOW_DAYS: i64 = 30;

/// A validated `(start, end)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn to_epoch_seconds(&self) -> (f64, f64) {
        (epoch_seconds(self.start), epoch_seconds(self.end))
    }

    pub fn to_nanos(&self) -> (String, String) {
        (epoch_nanos(self.start), epoch_nanos(self.end))
    }

    pub fn human_label(&self) -> String {
        human_label(self.start, self.end)
    }
}

/// Resolves and validates time windows.
#[derive(Debug, Clone)]
pub struct TimeWindowResolver {
    default_window: Duration,
}

impl Default for TimeWindowResolver {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

impl TimeWindowResolver {
    pub fn new(default_window: Duration) -> Self {
        Self { default_window }
    }

    pub fn default_window(&self) -> Duration {
        self.default_window
    }

    /// Compute `(start, end)` from a duration or explicit bounds.
    ///
    /// `end` defaults to now. An explicit `start` wins over `duration`;
    /// otherwise `start = end - duration` (or the default window). A
    /// duration reaching outside the representable range is `TooWide`.
    pub fn resolve(
        &self,
        duration: Option<Duration>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), InvalidRange> {
        let end = end.unwrap_or_else(Utc::now);
        if let Some(start) = start {
            return Ok((start, end));
        }
        let window = duration.unwrap_or(self.default_window);
        let start = end
            .checked_sub_signed(window)
            .ok_or(InvalidRange::TooWide {
                days: window.num_days(),
                max_days: MAX_WINDOW_DAYS,
            })?;
        Ok((start, end))
    }

    /// Returns false (and logs why) for ranges no backend should be asked for.
    pub fn validate(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match self.check(start, end) {
            Ok(_) => true,
            Err(reason) => {
                error!(%start, %end, %reason, "Invalid time range");
                false
            }
        }
    }

    /// Typed form of [`validate`](Self::validate).
    pub fn check(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TimeWindow, InvalidRange> {
        check_at(start, end, Utc::now())
    }

    /// Resolve, then check.
    pub fn window(
        &self,
        duration: Option<Duration>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TimeWindow, InvalidRange> {
        let (start, end) = self.resolve(duration, start, end)?;
        self.check(start, end)
    }
}

/// Validate `(start, end)` against an explicit "now".
pub fn check_at(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<TimeWindow, InvalidRange> {
    if start > end {
        return Err(InvalidRange::StartAfterEnd { start, end });
    }
    if end > now {
        return Err(InvalidRange::EndInFuture(end));
    }
    let span = end - start;
    if span > Duration::days(MAX_WINDOW_DAYS) {
        return Err(InvalidRange::TooWide {
            days: span.num_days(),
            max_days: MAX_WINDOW_DAYS,
        });
    }
    Ok(TimeWindow { start, end })
}

pub fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_nanos()) / 1e9
}

pub fn epoch_nanos(ts: DateTime<Utc>) -> String {
    let nanos = i128::from(ts.timestamp()) * 1_000_000_000 + i128::from(ts.timestamp_subsec_nanos());
    nanos.to_string()
}

/// Convert a nanosecond epoch string (as sent by Loki) to a timestamp.
pub fn from_epoch_nanos(raw: &str) -> Option<DateTime<Utc>> {
    let nanos: i128 = raw.trim().parse().ok()?;
    let secs = i64::try_from(nanos.div_euclid(1_000_000_000)).ok()?;
    let sub = u32::try_from(nanos.rem_euclid(1_000_000_000)).ok()?;
    DateTime::from_timestamp(secs, sub)
}

/// `"last N minutes"`, `"last N hours"`, or `"last N days"` (truncated).
pub fn human_label(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let secs = (end - start).num_seconds();
    let hours = secs as f64 / 3600.0;
    if hours < 1.0 {
        format!("last {} minutes", secs / 60)
    } else if hours < 24.0 {
        format!("last {} hours", secs / 3600)
    } else {
        format!("last {} days", secs / 86_400)
    }
}

/// Parse a compact duration such as `90s`, `15m`, `2h`, `7d`, or `1w`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration '{}' (use s, m, h, d, or w)", input))?;
    let (digits, unit) = s.split_at(split);
    let amount: i64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", input))?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, input)),
    };
    amount
        .checked_mul(unit_secs)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| format!("duration '{}' is out of range", input))
}

/// Parse RFC 3339, or a naive ISO 8601 timestamp interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_resolve_defaults_to_last_hour() {
        let resolver = TimeWindowResolver::default();
        let end = at(12, 0);
        let (start, resolved_end) = resolver.resolve(None, None, Some(end)).unwrap();
        assert_eq!(resolved_end, end);
        assert_eq!(start, at(11, 0));
    }

    #[test]
    fn test_resolve_explicit_start_wins() {
        let resolver = TimeWindowResolver::default();
        let (start, _) = resolver
            .resolve(Some(Duration::hours(5)), Some(at(9, 30)), Some(at(12, 0)))
            .unwrap();
        assert_eq!(start, at(9, 30));
    }

    #[test]
    fn test_resolve_uses_duration() {
        let resolver = TimeWindowResolver::default();
        let (start, end) = resolver
            .resolve(Some(Duration::minutes(15)), None, Some(at(12, 0)))
            .unwrap();
        assert_eq!(end - start, Duration::minutes(15));
    }

    #[test]
    fn test_resolve_rejects_unrepresentable_window() {
        let resolver = TimeWindowResolver::default();
        let huge = Duration::days(100_000_000);
        assert!(matches!(
            resolver.resolve(Some(huge), None, Some(at(12, 0))),
            Err(InvalidRange::TooWide { days: 100_000_000, max_days: MAX_WINDOW_DAYS })
        ));
        assert!(matches!(
            resolver.window(Some(huge), None, None),
            Err(InvalidRange::TooWide { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_inverted() {
        let now = at(23, 0);
        for (s, e) in [(at(12, 1), at(12, 0)), (at(20, 0), at(1, 0))] {
            assert!(matches!(
                check_at(s, e, now),
                Err(InvalidRange::StartAfterEnd { .. })
            ));
        }
        assert!(!TimeWindowResolver::default().validate(at(12, 1), at(12, 0)));
    }

    #[test]
    fn test_validate_rejects_future_end() {
        let resolver = TimeWindowResolver::default();
        let now = Utc::now();
        assert!(!resolver.validate(now - Duration::hours(1), now + Duration::minutes(5)));
        assert!(matches!(
            check_at(at(10, 0), at(12, 0), at(11, 0)),
            Err(InvalidRange::EndInFuture(_))
        ));
    }

    #[test]
    fn test_validate_rejects_over_thirty_days() {
        let end = at(12, 0);
        let start = end - Duration::days(30) - Duration::seconds(1);
        assert!(matches!(
            check_at(start, end, end),
            Err(InvalidRange::TooWide { .. })
        ));
        assert!(check_at(end - Duration::days(30), end, end).is_ok());
    }

    #[test]
    fn test_validate_accepts_recent_window() {
        let resolver = TimeWindowResolver::default();
        let window = resolver.window(Some(Duration::hours(2)), None, None).unwrap();
        assert_eq!(window.duration(), Duration::hours(2));
    }

    #[test]
    fn test_nanos_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let nanos = epoch_nanos(ts);
        assert_eq!(nanos, "1709287200000000000");
        assert_eq!(from_epoch_nanos(&nanos), Some(ts));
        assert_eq!(from_epoch_nanos("not-a-number"), None);
    }

    #[test]
    fn test_epoch_seconds() {
        let window = check_at(at(10, 0), at(11, 0), at(12, 0)).unwrap();
        let (s, e) = window.to_epoch_seconds();
        assert_eq!(e - s, 3600.0);
        assert_eq!(s, 1709287200.0);
    }

    #[test]
    fn test_human_label() {
        assert_eq!(human_label(at(10, 0), at(10, 45)), "last 45 minutes");
        assert_eq!(human_label(at(9, 0), at(12, 30)), "last 3 hours");
        let end = at(12, 0);
        assert_eq!(human_label(end - Duration::days(3), end), "last 3 days");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_duration("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration("1w").unwrap(), Duration::days(7));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5y").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_parse_timestamp_accepts_naive_iso() {
        let ts = parse_timestamp("2024-03-01T10:00:00").unwrap();
        assert_eq!(ts, at(10, 0));
        let ts = parse_timestamp("2024-03-01T10:00:00+01:00").unwrap();
        assert_eq!(ts, at(9, 0));
    }
}
