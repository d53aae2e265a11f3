//! Durable task, result and settings storage on SQLite.
//!
//! All cross-process state lives here: the host process registers tasks,
//! the worker subprocess polls and disposes of them, the admin tool
//! inspects both. No component caches rows in memory across operations,
//! so every read reflects the latest durable write.
//!
//! | Table      | Contents                                          |
//! |------------|---------------------------------------------------|
//! | `tasks`    | pending one-shot and recurring calls              |
//! | `results`  | outcomes of delegate calls, reaped after their TTL|
//! | `settings` | one row: `max_workers`, `running_workers`         |

pub mod args;
pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use args::{decode_args, encode_args, ArgsError, TaskArgs, TaskValue};
pub use error::{Result, StorageError};
pub use store::TaskStore;
pub use types::{Outcome, ResultRecord, ResultStatus, Settings, TaskRecord};
