use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime};

use crate::error::ScheduleError;

/// Inclusive value domain of one crontab field.
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
};

/// A parsed five-field crontab expression.
///
/// Each field is expanded into a sorted, deduplicated value set at parse
/// time. Day-of-week values are normalized to 0-6 with 0 = Sunday; 7 is
/// accepted in the input as an alias for Sunday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crontab {
    expr: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_is_wildcard: bool,
    dow_is_wildcard: bool,
}

impl Crontab {
    /// The raw expression this rule was parsed from.
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Whether `date` is selected by the month and day fields.
    ///
    /// Day handling follows the conventional crontab rule: a field that is
    /// literally `*` imposes no restriction, and when both day-of-month and
    /// day-of-week are restricted a date is selected if either one matches.
    pub(crate) fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_is_wildcard, self.dow_is_wildcard) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    /// Earliest selected wall-clock time on a matching day, constrained to
    /// `floor` or later when one is given. `None` when every selected time
    /// on the day lies before the floor.
    pub(crate) fn first_time_at_or_after(&self, floor: Option<NaiveTime>) -> Option<NaiveTime> {
        for &hour in &self.hours {
            for &minute in &self.minutes {
                let candidate = NaiveTime::from_hms_opt(hour, minute, 0)?;
                match floor {
                    Some(limit) if candidate < limit => continue,
                    _ => return Some(candidate),
                }
            }
        }
        None
    }
}

impl fmt::Display for Crontab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}

impl FromStr for Crontab {
    type Err = ScheduleError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount {
                expr: expr.to_string(),
                found: fields.len(),
            });
        }
        let minutes = parse_field(fields[0], &MINUTE)?;
        let hours = parse_field(fields[1], &HOUR)?;
        let days_of_month = parse_field(fields[2], &DAY_OF_MONTH)?;
        let months = parse_field(fields[3], &MONTH)?;
        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK)?;
        for day in days_of_week.iter_mut() {
            if *day == 7 {
                *day = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();
        Ok(Self {
            expr: expr.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_is_wildcard: fields[2] == "*",
            dow_is_wildcard: fields[4] == "*",
        })
    }
}

/// Expand one field into its sorted set of values.
///
/// Per comma-separated part the grammar is `*`, `*/step`, `value`,
/// `value/step` (a range open towards the field maximum), `a-b` and
/// `a-b/step`.
fn parse_field(spec: &str, field: &FieldSpec) -> Result<Vec<u32>, ScheduleError> {
    let mut values = Vec::new();
    for part in spec.split(',') {
        expand_part(part, spec, field, &mut values)?;
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn expand_part(
    part: &str,
    spec: &str,
    field: &FieldSpec,
    out: &mut Vec<u32>,
) -> Result<(), ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidField {
        field: field.name,
        spec: spec.to_string(),
        reason,
    };

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| invalid(format!("bad step {step:?}")))?;
            if step == 0 {
                return Err(invalid("step must be positive".into()));
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (lo, hi) = if range == "*" {
        (field.min, field.max)
    } else if let Some((a, b)) = range.split_once('-') {
        let lo: u32 = a
            .parse()
            .map_err(|_| invalid(format!("bad value {a:?}")))?;
        let hi: u32 = b
            .parse()
            .map_err(|_| invalid(format!("bad value {b:?}")))?;
        if lo > hi {
            return Err(invalid(format!("reversed range {range:?}")));
        }
        (lo, hi)
    } else {
        let value: u32 = range
            .parse()
            .map_err(|_| invalid(format!("bad value {range:?}")))?;
        if step > 1 {
            (value, field.max)
        } else {
            (value, value)
        }
    };

    if lo < field.min || hi > field.max {
        return Err(invalid(format!(
            "{lo}-{hi} outside {}-{}",
            field.min, field.max
        )));
    }
    out.extend((lo..=hi).step_by(step as usize));
    Ok(())
}
