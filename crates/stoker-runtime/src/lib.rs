//! Supervisor, worker and enqueue surface.
//!
//! | module | role |
//! |---|---|
//! | [`engine`] | owns the supervisor lifecycle and the startup semaphore |
//! | [`monitor`] | keeps one worker subprocess alive |
//! | [`worker`] | polls the store and runs due handlers |
//! | [`producer`] | writes task rows for the worker to pick up |
//! | [`registry`] | maps handler names to functions |
//! | [`signals`] | forwards termination signals onto a shutdown channel |
//!
//! A process embeds this by building a [`HandlerRegistry`], creating an
//! [`Engine`] over a [`stoker_core::Context`] and calling
//! [`Engine::start`]. Exactly one supervisor runs per working directory;
//! extra processes lose the semaphore race and simply keep producing.

pub mod engine;
pub mod error;
pub mod monitor;
pub mod producer;
pub mod registry;
pub mod signals;
pub mod worker;

pub use engine::Engine;
pub use error::{Result, RuntimeError};
pub use monitor::Monitor;
pub use producer::{defer, defer_with_result, schedule_cron};
pub use registry::{HandlerFn, HandlerRegistry};
pub use worker::{run_if_spawned, run_worker, Worker, WORKER_FLAG};
