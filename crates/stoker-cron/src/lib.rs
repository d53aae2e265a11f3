//! Five-field crontab parsing and next-occurrence computation.
//!
//! The grammar is the classic `minute hour day-of-month month day-of-week`
//! line with `*`, literals, comma lists, `a-b` ranges and `/step` suffixes:
//!
//! | Field        | Domain          |
//! |--------------|-----------------|
//! | minute       | 0-59            |
//! | hour         | 0-23            |
//! | day-of-month | 1-31            |
//! | month        | 1-12            |
//! | day-of-week  | 0-7, 7 = Sunday |
//!
//! [`compute_next_schedule`] is the one entry point the rest of the system
//! needs: given an expression and a reference instant it returns the first
//! selected instant strictly after it, always in UTC, always on a whole
//! minute. Parsing and evaluation are side-effect free, so callers can also
//! use it to validate an expression before persisting anything.

pub mod error;
pub mod rule;
pub mod schedule;

pub use error::{Result, ScheduleError};
pub use rule::Crontab;
pub use schedule::{compute_next_schedule, next_occurrence};
