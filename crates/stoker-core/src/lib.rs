//! `stoker-core`: shared configuration and process context.
//!
//! Everything stateful in stoker hangs off a [`Context`]: it carries the
//! loaded [`StokerConfig`] and the per-working-directory base folder that
//! holds the database file, the semaphore marker and the optional
//! `stoker.toml`. The context is built once per process and passed to the
//! engine, the worker and the admin tool at construction; there are no
//! process-wide singletons.

pub mod config;
pub mod context;
pub mod error;

pub use config::{StokerConfig, WorkerConfig};
pub use context::Context;
pub use error::{Result, StokerError};
