//! Recurrence rules and next-run computation.
//!
//! Everything here is pure: no state, no I/O. All instants are UTC.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::cron::CronExpr;

/// Largest interval chrono can represent as a `Duration`.
const MAX_INTERVAL_SECS: u64 = (i64::MAX / 1000) as u64;

/// A recurrence rule as written in the schedule file.
///
/// ```json
/// {"type": "weekly", "weekday": "sunday", "time": "03:30"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawSchedule {
    Interval { seconds: Option<u64> },
    Daily { time: Option<String> },
    Weekly { weekday: Option<String>, time: Option<String> },
    Cron { expression: Option<String> },
}

/// A validated recurrence rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    /// Every N seconds, measured from the previous completion.
    Interval { seconds: u64 },
    /// Every day at the given UTC time.
    Daily { time: NaiveTime },
    /// Once a week on `weekday` at the given UTC time.
    Weekly { weekday: Weekday, time: NaiveTime },
    /// Five-field cron expression.
    Cron { expression: CronExpr },
}

impl ScheduleSpec {
    /// Validate a raw rule. The error string is meant to be wrapped in
    /// [`crate::IngestError::ScheduleParse`] together with the job name.
    pub fn parse(raw: &RawSchedule) -> Result<Self, String> {
        match raw {
            RawSchedule::Interval { seconds } => match seconds {
                None => Err("interval schedule is missing 'seconds'".into()),
                Some(0) => Err("interval 'seconds' must be at least 1".into()),
                Some(s) if *s > MAX_INTERVAL_SECS => Err(format!(
                    "interval 'seconds' must be at most {}",
                    MAX_INTERVAL_SECS
                )),
                Some(s) => Ok(Self::Interval { seconds: *s }),
            },
            RawSchedule::Daily { time } => {
                let time = required(time, "daily", "time")?;
                Ok(Self::Daily {
                    time: parse_time(time)?,
                })
            }
            RawSchedule::Weekly { weekday, time } => {
                let weekday = required(weekday, "weekly", "weekday")?;
                let time = required(time, "weekly", "time")?;
                Ok(Self::Weekly {
                    weekday: parse_weekday(weekday)?,
                    time: parse_time(time)?,
                })
            }
            RawSchedule::Cron { expression } => {
                let expression = required(expression, "cron", "expression")?;
                let expression = CronExpr::parse(expression).map_err(|e| e.to_string())?;
                Ok(Self::Cron { expression })
            }
        }
    }

    /// Short kind label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Interval { .. } => "interval",
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
            Self::Cron { .. } => "cron",
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { seconds } => write!(f, "every {}s", seconds),
            Self::Daily { time } => write!(f, "daily at {}", time.format("%H:%M")),
            Self::Weekly { weekday, time } => {
                write!(f, "weekly on {} at {}", weekday, time.format("%H:%M"))
            }
            Self::Cron { expression } => write!(f, "cron '{}'", expression),
        }
    }
}

/// Compute the first due instant strictly after `now`.
///
/// Interval schedules are not drift-compensated: callers pass the completion
/// instant, so execution latency pushes later runs back. Interval rules fail
/// when the sum leaves chrono's date range; cron rules fail when no matching
/// minute exists within four years.
pub fn compute_next_run(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    match spec {
        ScheduleSpec::Interval { seconds } => i64::try_from(*seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|step| now.checked_add_signed(step))
            .ok_or_else(|| format!("interval of {}s overflows the calendar", seconds)),

        ScheduleSpec::Daily { time } => {
            let candidate = Utc.from_utc_datetime(&now.date_naive().and_time(*time));
            if now < candidate {
                Ok(candidate)
            } else {
                Ok(candidate + Duration::days(1))
            }
        }

        ScheduleSpec::Weekly { weekday, time } => {
            let today = now.weekday().num_days_from_monday() as i64;
            let target = weekday.num_days_from_monday() as i64;
            let days_ahead = (target - today).rem_euclid(7);

            let date = now.date_naive() + Duration::days(days_ahead);
            let candidate = Utc.from_utc_datetime(&date.and_time(*time));
            if candidate > now {
                Ok(candidate)
            } else {
                // Today is the target day but the slot has passed.
                Ok(candidate + Duration::days(7))
            }
        }

        ScheduleSpec::Cron { expression } => expression
            .next_after(now)
            .ok_or_else(|| format!("cron '{}' has no match within 4 years", expression)),
    }
}

fn required<'a>(value: &'a Option<String>, kind: &str, field: &str) -> Result<&'a str, String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("{} schedule is missing '{}'", kind, field)),
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| format!("invalid time '{}', expected HH:MM", value))
}

/// Parse a full English weekday name or its 3-letter abbreviation.
pub fn parse_weekday(value: &str) -> Result<Weekday, String> {
    let day = match value.to_ascii_lowercase().as_str() {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => return Err(format!("unknown weekday '{}'", value)),
    };
    Ok(day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn spec(json: &str) -> ScheduleSpec {
        let raw: RawSchedule = serde_json::from_str(json).unwrap();
        ScheduleSpec::parse(&raw).unwrap()
    }

    #[test]
    fn test_interval_adds_exact_seconds() {
        let s = spec(r#"{"type":"interval","seconds":300}"#);
        let now = at("2024-01-01T10:00:17.250Z");
        assert_eq!(compute_next_run(&s, now).unwrap(), now + Duration::seconds(300));
    }

    #[test]
    fn test_daily_before_and_after_slot() {
        let s = spec(r#"{"type":"daily","time":"02:00"}"#);
        assert_eq!(
            compute_next_run(&s, at("2024-01-01T03:00:00Z")).unwrap(),
            at("2024-01-02T02:00:00Z")
        );
        assert_eq!(
            compute_next_run(&s, at("2024-01-01T01:00:00Z")).unwrap(),
            at("2024-01-01T02:00:00Z")
        );
    }

    #[test]
    fn test_daily_exactly_at_slot_moves_to_tomorrow() {
        let s = spec(r#"{"type":"daily","time":"02:00"}"#);
        assert_eq!(
            compute_next_run(&s, at("2024-01-01T02:00:00Z")).unwrap(),
            at("2024-01-02T02:00:00Z")
        );
    }

    #[test]
    fn test_weekly_wraps_to_next_week() {
        let s = spec(r#"{"type":"weekly","weekday":"Wednesday","time":"09:30"}"#);
        // 2024-01-03 is a Wednesday.
        assert_eq!(
            compute_next_run(&s, at("2024-01-03T08:00:00Z")).unwrap(),
            at("2024-01-03T09:30:00Z")
        );
        assert_eq!(
            compute_next_run(&s, at("2024-01-03T09:30:00Z")).unwrap(),
            at("2024-01-10T09:30:00Z")
        );
        assert_eq!(
            compute_next_run(&s, at("2024-01-06T00:00:00Z")).unwrap(),
            at("2024-01-10T09:30:00Z")
        );
    }

    #[test]
    fn test_cron_sunday_example() {
        let s = spec(r#"{"type":"cron","expression":"0 2 * * 0"}"#);
        assert_eq!(
            compute_next_run(&s, at("2024-01-03T00:00:00Z")).unwrap(),
            at("2024-01-07T02:00:00Z")
        );
    }

    #[test]
    fn test_result_always_strictly_after_now() {
        let specs = [
            spec(r#"{"type":"interval","seconds":1}"#),
            spec(r#"{"type":"daily","time":"00:00"}"#),
            spec(r#"{"type":"weekly","weekday":"sun","time":"23:59"}"#),
            spec(r#"{"type":"cron","expression":"* * * * *"}"#),
        ];
        let mut now = at("2024-12-31T23:59:00Z");
        for _ in 0..50 {
            for s in &specs {
                let next = compute_next_run(s, now).unwrap();
                assert!(next > now, "{} returned {} for {}", s, next, now);
                assert!(compute_next_run(s, next).unwrap() > next);
            }
            now = now + Duration::minutes(97);
        }
    }

    #[test]
    fn test_missing_fields_rejected() {
        for json in [
            r#"{"type":"interval"}"#,
            r#"{"type":"interval","seconds":0}"#,
            r#"{"type":"daily"}"#,
            r#"{"type":"weekly","time":"02:00"}"#,
            r#"{"type":"weekly","weekday":"friday"}"#,
            r#"{"type":"cron"}"#,
        ] {
            let raw: RawSchedule = serde_json::from_str(json).unwrap();
            assert!(ScheduleSpec::parse(&raw).is_err(), "accepted {}", json);
        }
    }

    #[test]
    fn test_oversized_interval_rejected_at_parse() {
        let raw = RawSchedule::Interval { seconds: Some(u64::MAX) };
        assert!(ScheduleSpec::parse(&raw).is_err());
    }

    #[test]
    fn test_huge_interval_errors_instead_of_panicking() {
        let s = spec(&format!(r#"{{"type":"interval","seconds":{}}}"#, MAX_INTERVAL_SECS));
        let err = compute_next_run(&s, at("2024-01-01T00:00:00Z")).unwrap_err();
        assert!(err.contains("overflows"), "{}", err);
    }

    #[test]
    fn test_bad_weekday_and_time_rejected() {
        let raw: RawSchedule =
            serde_json::from_str(r#"{"type":"weekly","weekday":"funday","time":"02:00"}"#).unwrap();
        assert_eq!(
            ScheduleSpec::parse(&raw).unwrap_err(),
            "unknown weekday 'funday'"
        );
        let raw: RawSchedule = serde_json::from_str(r#"{"type":"daily","time":"25:00"}"#).unwrap();
        assert!(ScheduleSpec::parse(&raw).is_err());
    }

    #[test]
    fn test_unknown_schedule_type_is_a_decode_error() {
        assert!(serde_json::from_str::<RawSchedule>(r#"{"type":"monthly"}"#).is_err());
    }
}
