//! Five-field crontab expressions on top of the `cron` crate.
//!
//! Fields are minute, hour, day-of-month, month, day-of-week (0 = Sunday,
//! 7 is accepted as an alias). Day-of-month and day-of-week are OR-combined
//! when both are restricted, as in Vixie cron.
//!
//! Each field is validated and expanded to an explicit value list, then
//! handed to `cron::Schedule` with a leading seconds field. Weekdays are
//! passed by name because the crate numbers them from 1 = Sunday. The crate
//! ANDs its day fields, so the OR case is two schedules whose earlier
//! match wins.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use cron::Schedule as CronSchedule;

/// Upper bound of the forward search, in days (four years).
const SEARCH_DAYS: i64 = 4 * 365 + 1;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A parsed cron expression.
#[derive(Clone)]
pub struct CronExpr {
    source: String,
    schedules: Vec<CronSchedule>,
}

/// Why an expression was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronError(String);

impl fmt::Display for CronError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CronError {}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES };
// 7 is folded onto Sunday after expansion.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAY_NAMES };

impl CronExpr {
    /// Parse a 5-field expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError(format!(
                "expected 5 fields, found {} in '{}'",
                fields.len(),
                expression
            )));
        }

        let minutes = join(&expand(fields[0], &MINUTE)?);
        let hours = join(&expand(fields[1], &HOUR)?);
        let days_of_month = join(&expand(fields[2], &DAY_OF_MONTH)?);
        let months = join(&expand(fields[3], &MONTH)?);
        let days_of_week = weekday_names(&expand(fields[4], &DAY_OF_WEEK)?);

        let dom_restricted = !fields[2].starts_with('*');
        let dow_restricted = !fields[4].starts_with('*');

        let (dom, dow) = (days_of_month.as_str(), days_of_week.as_str());
        // A `*`-led field such as `*/2` still filters in the AND case.
        let day_pairs = if dom_restricted && dow_restricted {
            vec![(dom, "*"), ("*", dow)]
        } else {
            vec![(dom, dow)]
        };

        let schedules = day_pairs
            .into_iter()
            .map(|(dom, dow)| {
                let six_field = format!("0 {} {} {} {} {}", minutes, hours, dom, months, dow);
                CronSchedule::from_str(&six_field)
                    .map_err(|e| CronError(format!("invalid cron expression '{}': {}", expression, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: fields.join(" "),
            schedules,
        })
    }

    /// The normalized expression text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Earliest matching minute strictly after `now`, or `None` when nothing
    /// matches within four years (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = now.with_second(0)?.with_nanosecond(0)?;
        let limit = floor.checked_add_signed(Duration::days(SEARCH_DAYS))?;

        self.schedules
            .iter()
            .filter_map(|schedule| {
                schedule
                    .after(&floor)
                    .take_while(|t| *t <= limit)
                    .find(|t| *t > now)
            })
            .min()
    }
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.source).finish()
    }
}

// Two expressions are equal when their normalized text is.
impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpr {}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn join(values: &BTreeSet<u32>) -> String {
    values.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

fn weekday_names(values: &BTreeSet<u32>) -> String {
    let days: BTreeSet<usize> = values.iter().map(|v| *v as usize % 7).collect();
    days.into_iter()
        .map(|d| WEEKDAY_NAMES[d].to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(",")
}

fn expand(field: &str, spec: &FieldSpec) -> Result<BTreeSet<u32>, CronError> {
    let mut values = BTreeSet::new();
    for item in field.split(',') {
        if item.is_empty() {
            return Err(CronError(format!("empty list item in {} field '{}'", spec.name, field)));
        }
        expand_item(item, spec, &mut values)?;
    }
    Ok(values)
}

fn expand_item(item: &str, spec: &FieldSpec, values: &mut BTreeSet<u32>) -> Result<(), CronError> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| {
                CronError(format!("invalid step '{}' in {} field", step, spec.name))
            })?;
            if step == 0 {
                return Err(CronError(format!("zero step in {} field", spec.name)));
            }
            (range, Some(step))
        }
        None => (item, None),
    };

    let (lo, hi) = if range == "*" {
        (spec.min, spec.max)
    } else if let Some((a, b)) = range.split_once('-') {
        let lo = parse_value(a, spec)?;
        let hi = parse_value(b, spec)?;
        if lo > hi {
            return Err(CronError(format!(
                "descending range '{}' in {} field",
                range, spec.name
            )));
        }
        (lo, hi)
    } else {
        let v = parse_value(range, spec)?;
        // `a/n` means "from a to the field maximum every n".
        if step.is_some() {
            (v, spec.max)
        } else {
            (v, v)
        }
    };

    values.extend((lo..=hi).step_by(step.unwrap_or(1) as usize));
    Ok(())
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, CronError> {
    let lower = raw.to_ascii_lowercase();
    let value = match spec.names.iter().position(|n| *n == lower) {
        // Month names are 1-based, weekday names 0-based.
        Some(idx) => idx as u32 + spec.min,
        None => raw.parse::<u32>().map_err(|_| {
            CronError(format!("invalid value '{}' in {} field", raw, spec.name))
        })?,
    };
    if value < spec.min || value > spec.max {
        return Err(CronError(format!(
            "value {} out of range {}-{} in {} field",
            value, spec.min, spec.max, spec.name
        )));
    }
    Ok(value)
}
