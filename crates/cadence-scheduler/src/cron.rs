//! Five-field cron expressions evaluated in UTC.
//!
//! Grammar per field: `*`, values, ranges (`a-b`), steps (`*/n`, `a-b/n`,
//! `a/n`) and comma lists. Months and weekdays accept three-letter names,
//! weekday `7` is Sunday. When both day-of-month and day-of-week are
//! restricted a day matches if either does (Vixie cron semantics).
//!
//! Fields are validated and normalised here; fire times come from the
//! `cron` crate, which takes a leading seconds field and numbers weekdays
//! 1-7 from Sunday.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("empty cron expression")]
    Empty,
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("unknown alias '{0}'")]
    UnknownAlias(String),
    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid {field} range {start}-{end}")]
    InvalidRange {
        field: &'static str,
        start: u32,
        end: u32,
    },
    #[error("invalid {field} step '{value}'")]
    InvalidStep { field: &'static str, value: String },
    #[error("invalid cron expression '{expr}': {reason}")]
    Rejected { expr: String, reason: String },
    #[error("expression '{0}' never fires")]
    NeverFires(String),
}

impl cadence_core::Classify for CronError {
    fn class(&self) -> cadence_core::ErrorClass {
        cadence_core::ErrorClass::Fatal
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<&'static [&'static str]>,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: None,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: None,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: None,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: Some(&MONTH_NAMES),
};
// 7 is accepted and folded onto 0
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: Some(&WEEKDAY_NAMES),
};

/// One comma-separated item of a field
#[derive(Debug, Clone, Copy)]
struct Item {
    start: u32,
    end: u32,
    step: Option<u32>,
    wildcard: bool,
}

impl Item {
    fn render(&self) -> String {
        match (self.wildcard, self.step) {
            (true, None) => "*".to_string(),
            (true, Some(step)) => format!("*/{step}"),
            (false, None) if self.start == self.end => self.start.to_string(),
            (false, None) => format!("{}-{}", self.start, self.end),
            (false, Some(step)) => format!("{}-{}/{}", self.start, self.end, step),
        }
    }

    fn values(&self) -> impl Iterator<Item = u32> {
        (self.start..=self.end).step_by(self.step.unwrap_or(1) as usize)
    }
}

/// A parsed cron expression
#[derive(Clone)]
pub struct CronExpr {
    source: String,
    /// Fire times are the union of these. Two entries only when both day
    /// fields are restricted.
    schedules: Vec<::cron::Schedule>,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(CronError::Empty);
        }

        let expanded = if let Some(alias) = trimmed.strip_prefix('@') {
            match alias.to_ascii_lowercase().as_str() {
                "yearly" | "annually" => "0 0 1 1 *",
                "monthly" => "0 0 1 * *",
                "weekly" => "0 0 * * 0",
                "daily" | "midnight" => "0 0 * * *",
                "hourly" => "0 * * * *",
                _ => return Err(CronError::UnknownAlias(trimmed.to_string())),
            }
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let minute = normalize(fields[0], MINUTE)?;
        let hour = normalize(fields[1], HOUR)?;
        let dom = normalize(fields[2], DAY_OF_MONTH)?;
        let month = normalize(fields[3], MONTH)?;
        let dow = normalize_weekdays(fields[4])?;

        let dom_restricted = !fields[2].starts_with('*');
        let dow_restricted = !fields[4].starts_with('*');

        let build = |dom: &str, dow: &str| {
            let six = format!("0 {minute} {hour} {dom} {month} {dow}");
            ::cron::Schedule::from_str(&six).map_err(|e| CronError::Rejected {
                expr: trimmed.to_string(),
                reason: e.to_string(),
            })
        };
        let schedules = if dom_restricted && dow_restricted {
            vec![build(&dom, "*")?, build("*", &dow)?]
        } else {
            vec![build(&dom, &dow)?]
        };

        let cron = Self {
            source: trimmed.to_string(),
            schedules,
        };

        // Rejects things like "0 0 30 2 *"
        let origin = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).single();
        if origin.and_then(|t| cron.next_after(t)).is_none() {
            return Err(CronError::NeverFires(cron.source));
        }
        Ok(cron)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `t` (truncated to the minute) is a fire time
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        let Some(minute) = t.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
            return false;
        };
        minute
            .checked_sub_signed(Duration::seconds(1))
            .and_then(|before| self.next_after(before))
            == Some(minute)
    }

    /// Earliest fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(&after).next())
            .min()
    }

    /// The next `count` fire times after `after`
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }
}

/// Validate a field and rewrite names to numbers
fn normalize(raw: &str, spec: FieldSpec) -> Result<String, CronError> {
    let items = parse_items(raw, spec)?;
    Ok(items.iter().map(Item::render).collect::<Vec<_>>().join(","))
}

/// Expand the weekday field into an explicit list in `cron` crate numbering
fn normalize_weekdays(raw: &str) -> Result<String, CronError> {
    let items = parse_items(raw, DAY_OF_WEEK)?;
    let mut days = [false; 7];
    for item in &items {
        for v in item.values() {
            days[(v % 7) as usize] = true;
        }
    }
    let list: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(d, _)| (d + 1).to_string())
        .collect();
    if list.is_empty() {
        return Err(CronError::InvalidValue {
            field: DAY_OF_WEEK.name,
            value: raw.to_string(),
        });
    }
    Ok(list.join(","))
}

fn parse_items(raw: &str, spec: FieldSpec) -> Result<Vec<Item>, CronError> {
    raw.split(',').map(|item| parse_item(item, spec)).collect()
}

fn parse_item(item: &str, spec: FieldSpec) -> Result<Item, CronError> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let invalid = || CronError::InvalidStep {
                field: spec.name,
                value: item.to_string(),
            };
            let step: u32 = step.parse().map_err(|_| invalid())?;
            if step == 0 || step > spec.max {
                return Err(invalid());
            }
            (range, Some(step))
        }
        None => (item, None),
    };

    let (start, end, wildcard) = if range == "*" {
        (spec.min, spec.max, true)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_value(a, spec)?, parse_value(b, spec)?, false)
    } else {
        let v = parse_value(range, spec)?;
        // "a/n" runs from a to the end of the field
        if step.is_some() {
            (v, spec.max, false)
        } else {
            (v, v, false)
        }
    };

    if start > end {
        return Err(CronError::InvalidRange {
            field: spec.name,
            start,
            end,
        });
    }

    Ok(Item {
        start,
        end,
        step,
        wildcard,
    })
}

fn parse_value(raw: &str, spec: FieldSpec) -> Result<u32, CronError> {
    let invalid = || CronError::InvalidValue {
        field: spec.name,
        value: raw.to_string(),
    };

    let value = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let lower = raw.to_ascii_lowercase();
            let names = spec.names.ok_or_else(invalid)?;
            let idx = names.iter().position(|n| *n == lower).ok_or_else(invalid)? as u32;
            // Month names are 1-based, weekday names 0-based
            if spec.min == 1 {
                idx + 1
            } else {
                idx
            }
        }
    };

    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpr {}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Validate and return the next fire time after `after` in one call
pub fn next_run(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    let cron = CronExpr::parse(expr)?;
    cron.next_after(after)
        .ok_or_else(|| CronError::NeverFires(expr.to_string()))
}
