//! Cron parsing and timezone-aware occurrence computation.
//!
//! Schedules use standard 5-field cron (`min hour dom mon dow`, Sunday=0).
//! The `cron` crate wants a seconds field, so expressions are normalized to
//! its 6-field form internally; the 5-field shape is what users see and
//! what the store keeps.
//!
//! DST is resolved against the schedule's IANA zone: candidate firings are
//! generated in wall-clock time and mapped into the zone afterwards. A
//! candidate inside a spring-forward gap advances to the first valid
//! instant after the gap; a candidate inside a fold fires once, at the
//! first instance.

pub mod dispatcher;

use std::str::FromStr;

use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use crate::error::EngineError;

/// A validated cron expression.
#[derive(Debug, Clone)]
pub struct CronSpec {
    /// Canonical 5-field form (whitespace collapsed).
    pub normalized: String,
    schedule: CronSchedule,
}

/// Parse a 5-field cron expression.
pub fn parse_cron(expression: &str) -> Result<CronSpec, EngineError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(EngineError::Validation(format!(
            "cron expression must have 5 fields (minute hour day-of-month month day-of-week), got {}",
            fields.len()
        )));
    }

    let normalized = fields.join(" ");
    let six_field = format!("0 {normalized}");
    let schedule = CronSchedule::from_str(&six_field)
        .map_err(|e| EngineError::Validation(format!("invalid cron expression: {e}")))?;

    Ok(CronSpec {
        normalized,
        schedule,
    })
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, EngineError> {
    name.parse()
        .map_err(|_| EngineError::Validation(format!("unknown timezone {name:?}")))
}

impl CronSpec {
    /// The next firing strictly after `after`, in the given zone.
    ///
    /// Returns `None` when the schedule has no future firing (practically
    /// unreachable for 5-field expressions).
    pub fn next_after(&self, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();

        // Iterate candidates in wall-clock time (modelled as UTC so the
        // cron crate stays timezone-oblivious), then resolve each against
        // the real zone.
        let wall_clock_after = Utc.from_utc_datetime(&local_after);
        for candidate in self.schedule.after(&wall_clock_after).take(1000) {
            let naive = candidate.naive_utc();
            if let Some(resolved) = resolve_local(tz, naive) {
                return Some(resolved);
            }
        }
        None
    }

    /// The next `count` firings strictly after `after`.
    pub fn upcoming(&self, tz: Tz, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        for _ in 0..count {
            match self.next_after(tz, cursor) {
                Some(next) => {
                    cursor = next;
                    out.push(next);
                }
                None => break,
            }
        }
        out
    }
}

/// Map a wall-clock instant into a zone, applying the DST policy.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        // Fold (fall-back): fire once, at the first instance.
        LocalResult::Ambiguous(first, _second) => Some(first.with_timezone(&Utc)),
        // Gap (spring-forward): advance minute-by-minute to the first
        // wall-clock instant the zone can represent.
        LocalResult::None => {
            let mut probe = naive;
            for _ in 0..240 {
                probe += Duration::minutes(1);
                if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
                    return Some(dt.with_timezone(&Utc));
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    #[test]
    fn parses_five_field_expressions() {
        let spec = parse_cron("0 2 * * *").unwrap();
        assert_eq!(spec.normalized, "0 2 * * *");

        let spec = parse_cron("*/15  9-17  *  *  1-5").unwrap();
        assert_eq!(spec.normalized, "*/15 9-17 * * 1-5");
    }

    #[test]
    fn normalization_is_idempotent() {
        let spec = parse_cron("0   2 *  * *").unwrap();
        let reparsed = parse_cron(&spec.normalized).unwrap();
        assert_eq!(spec.normalized, reparsed.normalized);
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert!(parse_cron("0 2 * *").is_err());
        assert!(parse_cron("0 0 2 * * *").is_err());
        assert!(parse_cron("").is_err());
    }

    #[test]
    fn rejects_invalid_fields() {
        assert!(parse_cron("61 * * * *").is_err());
        assert!(parse_cron("* 25 * * *").is_err());
        assert!(parse_cron("not a cron at all").is_err());
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        assert!(parse_timezone("America/New_York").is_ok());
    }

    #[test]
    fn next_is_strictly_after() {
        let spec = parse_cron("0 12 * * *").unwrap();
        let noon = UTC.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap().to_utc();
        let next = spec.next_after(UTC, noon).unwrap();
        assert_eq!(
            next,
            UTC.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap().to_utc()
        );
    }

    #[test]
    fn ordinary_timezone_math() {
        // 09:00 New York in January is 14:00 UTC.
        let spec = parse_cron("0 9 * * *").unwrap();
        let after = UTC.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap().to_utc();
        let next = spec.next_after(New_York, after).unwrap();
        assert_eq!(
            next,
            UTC.with_ymd_and_hms(2024, 1, 10, 14, 0, 0).unwrap().to_utc()
        );
    }

    #[test]
    fn spring_forward_gap_advances_to_first_valid_instant() {
        // 2024-03-10 02:00 does not exist in New York; the 02:00 firing
        // lands on 03:00 EDT.
        let spec = parse_cron("0 2 * * *").unwrap();
        let after = New_York
            .with_ymd_and_hms(2024, 3, 9, 23, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = spec.next_after(New_York, after).unwrap();

        let local = next.with_timezone(&New_York);
        assert_eq!(local.format("%Y-%m-%d %H:%M").to_string(), "2024-03-10 03:00");
    }

    #[test]
    fn fall_back_fold_fires_once_at_first_instance() {
        // 2024-11-03 01:00 occurs twice in New York; the firing is the
        // first (EDT, UTC-4) instance.
        let spec = parse_cron("0 1 * * *").unwrap();
        let after = New_York
            .with_ymd_and_hms(2024, 11, 2, 23, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = spec.next_after(New_York, after).unwrap();

        assert_eq!(
            next,
            UTC.with_ymd_and_hms(2024, 11, 3, 5, 0, 0).unwrap().to_utc()
        );
    }

    #[test]
    fn upcoming_returns_monotonic_firings() {
        let spec = parse_cron("30 * * * *").unwrap();
        let after = UTC.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap().to_utc();
        let firings = spec.upcoming(UTC, after, 4);
        assert_eq!(firings.len(), 4);
        for pair in firings.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(
            firings[0],
            UTC.with_ymd_and_hms(2024, 6, 1, 0, 30, 0).unwrap().to_utc()
        );
    }
}
