use thiserror::Error;

use crate::args::ArgsError;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The addressed task row does not exist.
    #[error("task not found: id {id}")]
    TaskNotFound { id: i64 },

    /// The settings row is gone, which means the schema was tampered with.
    #[error("settings row missing")]
    SettingsMissing,

    /// A stored column holds data that cannot be interpreted any more.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Encoding or decoding a task argument blob failed.
    #[error("argument encoding error: {0}")]
    Args(#[from] ArgsError),
}

pub type Result<T> = std::result::Result<T, StorageError>;
