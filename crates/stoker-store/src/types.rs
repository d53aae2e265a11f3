use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::args::{TaskArgs, TaskValue};

/// Lifecycle state of a result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Registered together with its delegate task; no outcome yet.
    Waiting,
    /// The handler returned a value.
    Ready,
    /// The handler failed; see `error_message`.
    Error,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Waiting => "waiting",
            ResultStatus::Ready => "ready",
            ResultStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(ResultStatus::Waiting),
            "ready" => Ok(ResultStatus::Ready),
            "error" => Ok(ResultStatus::Error),
            other => Err(format!("unknown result status: {other}")),
        }
    }
}

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    /// Surrogate row id.
    pub id: i64,
    /// Correlation id linking to a result row; `None` for fire-and-forget.
    pub uuid: Option<String>,
    /// Due timestamp, the sole ordering key.
    pub schedule: DateTime<Utc>,
    /// Five-field recurrence expression; empty means one-shot.
    pub crontab: String,
    /// Registry key the worker resolves to a handler function.
    pub handler: String,
    /// Call arguments.
    pub args: TaskArgs,
}

impl TaskRecord {
    pub fn is_recurring(&self) -> bool {
        !self.crontab.is_empty()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule <= now
    }
}

/// A persisted result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    /// Correlation id, primary key.
    pub uuid: String,
    pub status: ResultStatus,
    /// Registry key of the task that produces this result (diagnostic copy).
    pub handler: String,
    /// Call arguments (diagnostic copy).
    pub args: TaskArgs,
    /// Return value once `status` is `Ready`.
    pub value: Option<TaskValue>,
    /// Failure description once `status` is `Error`.
    pub error_message: Option<String>,
    /// Absolute expiry; the sweep removes the row once now is past it.
    pub ttl: DateTime<Utc>,
}

impl ResultRecord {
    pub fn is_waiting(&self) -> bool {
        self.status == ResultStatus::Waiting
    }

    pub fn is_ready(&self) -> bool {
        self.status == ResultStatus::Ready
    }

    pub fn has_error(&self) -> bool {
        self.status == ResultStatus::Error
    }
}

/// What the worker observed when invoking a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler returned normally.
    Value(TaskValue),
    /// The handler returned an error or panicked.
    Failure(String),
}

/// The settings singleton row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Upper bound on concurrently executing tasks.
    pub max_workers: u32,
    /// Currently held execution permits.
    pub running_workers: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: 1,
            running_workers: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [ResultStatus::Waiting, ResultStatus::Ready, ResultStatus::Error] {
            let parsed: ResultStatus = status.to_string().parse().expect("parse failed");
            assert_eq!(parsed, status);
        }
        assert!("pending".parse::<ResultStatus>().is_err());
    }

    #[test]
    fn task_due_and_recurring_helpers() {
        let now = Utc::now();
        let task = TaskRecord {
            id: 1,
            uuid: None,
            schedule: now,
            crontab: String::new(),
            handler: "demo".into(),
            args: TaskArgs::none(),
        };
        assert!(task.is_due(now));
        assert!(!task.is_due(now - chrono::Duration::seconds(1)));
        assert!(!task.is_recurring());
        let recurring = TaskRecord {
            crontab: "* * * * *".into(),
            ..task
        };
        assert!(recurring.is_recurring());
    }
}
