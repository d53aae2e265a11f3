use thiserror::Error;

/// Errors that can occur inside the supervisor and worker runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Context construction or configuration failed.
    #[error(transparent)]
    Core(#[from] stoker_core::StokerError),

    /// A store operation failed.
    #[error(transparent)]
    Storage(#[from] stoker_store::StorageError),

    /// A crontab expression was rejected.
    #[error(transparent)]
    Schedule(#[from] stoker_cron::ScheduleError),

    /// A stored handler name has no entry in this process's registry.
    #[error("no handler registered for {handler:?}")]
    Resolution { handler: String },

    /// The invoked handler failed or panicked.
    #[error("handler {handler:?} failed: {message}")]
    Execution { handler: String, message: String },

    /// A filesystem or process operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
