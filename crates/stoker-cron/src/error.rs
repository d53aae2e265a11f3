use thiserror::Error;

/// Errors raised while parsing or evaluating a crontab expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// The expression does not split into exactly five fields.
    #[error("crontab needs 5 fields (minute hour day month weekday), found {found} in {expr:?}")]
    FieldCount { expr: String, found: usize },

    /// One field could not be parsed or selects an out-of-range value.
    #[error("invalid {field} field {spec:?}: {reason}")]
    InvalidField {
        field: &'static str,
        spec: String,
        reason: String,
    },

    /// The expression parses but selects no instant within the search
    /// horizon, e.g. `0 0 30 2 *`.
    #[error("crontab {expr:?} matches no instant within {years} years")]
    Unsatisfiable { expr: String, years: u32 },
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
