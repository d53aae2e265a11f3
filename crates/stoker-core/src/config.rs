use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StokerError};

/// Database filename inside the stoker directory.
pub const DB_FILE_NAME: &str = "stoker.db";
/// Semaphore marker filename inside the stoker directory.
pub const SEMAPHORE_FILE_NAME: &str = "stoker.semaphore";
/// Config filename inside the stoker directory.
pub const CONFIG_FILE_NAME: &str = "stoker.toml";

const MONITOR_IDLE_SECS: f64 = 2.0;
const WORKER_IDLE_SECS: f64 = 4.0;
const RESULT_TTL_SECS: u64 = 1800;

/// Top-level config (stoker.toml + STOKER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StokerConfig {
    /// When false the engine refuses to start the supervisor.
    #[serde(default = "bool_true")]
    pub active: bool,

    /// Database filename inside the per-cwd stoker directory.
    #[serde(default = "default_db_filename")]
    pub db_filename: String,

    /// Seconds the monitor waits between worker liveness checks.
    #[serde(default = "default_monitor_idle")]
    pub monitor_idle_secs: f64,

    /// Seconds the worker sleeps when no tasks are due.
    #[serde(default = "default_worker_idle")]
    pub worker_idle_secs: f64,

    /// Seconds a result entry is kept before the TTL sweep may purge it.
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,

    #[serde(default)]
    pub worker: WorkerConfig,
}

/// How the monitor launches the worker process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program to spawn. Unset means: re-exec the current executable with
    /// the worker flag appended.
    pub program: Option<String>,

    /// Arguments passed to `program`.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for StokerConfig {
    fn default() -> Self {
        Self {
            active: true,
            db_filename: default_db_filename(),
            monitor_idle_secs: MONITOR_IDLE_SECS,
            worker_idle_secs: WORKER_IDLE_SECS,
            result_ttl_secs: RESULT_TTL_SECS,
            worker: WorkerConfig::default(),
        }
    }
}

impl StokerConfig {
    /// Load config from a TOML file with STOKER_* env var overrides.
    ///
    /// A missing file is not an error: defaults apply and env overrides
    /// still merge. Nested keys use a double underscore in the environment,
    /// e.g. `STOKER_WORKER__PROGRAM`.
    pub fn load(path: &Path) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("STOKER_").split("__"))
            .extract()
            .map_err(|e| StokerError::Config(e.to_string()))
    }

    /// Monitor liveness-check interval.
    pub fn monitor_idle(&self) -> Duration {
        secs(self.monitor_idle_secs)
    }

    /// Worker idle sleep when no tasks are due.
    pub fn worker_idle(&self) -> Duration {
        secs(self.worker_idle_secs)
    }

    /// Storage time for result entries.
    pub fn result_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.result_ttl_secs.min(i64::MAX as u64) as i64)
    }
}

// Duration::from_secs_f64 panics on negative or non-finite input, so clamp
// whatever the config file delivered into a sane interval range.
fn secs(value: f64) -> Duration {
    if value.is_finite() {
        Duration::from_secs_f64(value.clamp(0.05, 3600.0))
    } else {
        Duration::from_secs_f64(1.0)
    }
}

fn bool_true() -> bool {
    true
}

fn default_db_filename() -> String {
    DB_FILE_NAME.to_string()
}

fn default_monitor_idle() -> f64 {
    MONITOR_IDLE_SECS
}

fn default_worker_idle() -> f64 {
    WORKER_IDLE_SECS
}

fn default_result_ttl() -> u64 {
    RESULT_TTL_SECS
}
