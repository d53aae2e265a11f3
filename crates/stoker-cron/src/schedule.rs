use chrono::{DateTime, Duration, Timelike, Utc};

use crate::error::{Result, ScheduleError};
use crate::rule::Crontab;

/// Upper bound on the day-by-day scan. Eight years reaches the next
/// February 29 from any start instant, including across a skipped
/// century leap year (2096 to 2104).
const HORIZON_YEARS: u32 = 8;

/// Compute the first instant selected by `expr` strictly after `from`.
///
/// The result always lands on a whole minute. The function is pure:
/// identical `(expr, from)` pairs yield the identical instant.
pub fn compute_next_schedule(expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let rule: Crontab = expr.parse()?;
    next_occurrence(&rule, from)
}

/// Like [`compute_next_schedule`] for an already-parsed rule.
pub fn next_occurrence(rule: &Crontab, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    // First candidate is the minute after `from`, seconds dropped, so the
    // result can never equal `from` itself.
    let start = from
        .with_second(0)
        .and_then(|dt| dt.with_nanosecond(0))
        .unwrap_or(from)
        + Duration::minutes(1);

    let start_date = start.date_naive();
    let mut date = start_date;
    for _ in 0..(HORIZON_YEARS * 366) {
        if rule.matches_date(date) {
            let floor = (date == start_date).then(|| start.time());
            if let Some(time) = rule.first_time_at_or_after(floor) {
                return Ok(DateTime::from_naive_utc_and_offset(date.and_time(time), Utc));
            }
        }
        date = match date.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    Err(ScheduleError::Unsatisfiable {
        expr: rule.expression().to_string(),
        years: HORIZON_YEARS,
    })
}
