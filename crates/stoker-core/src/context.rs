use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{StokerConfig, CONFIG_FILE_NAME, SEMAPHORE_FILE_NAME};
use crate::error::Result;

/// Per-process handle bundling configuration and the filesystem namespace.
///
/// All stoker state for one working directory lives under a single base
/// directory, so independent projects on the same machine never share a
/// database or a semaphore. The base is `~/.stoker/<cwd-prefix>/`, where the
/// prefix is the working directory with path separators replaced.
#[derive(Debug, Clone)]
pub struct Context {
    config: StokerConfig,
    base_dir: PathBuf,
    cwd: PathBuf,
}

impl Context {
    /// Build the context for the current working directory: derive the base
    /// directory, create it, and load `stoker.toml` when present. Falls back
    /// to defaults with a warning when the config file does not parse.
    pub fn initialize() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let base_dir = base_dir_for(dirs::home_dir().as_deref(), &cwd);
        std::fs::create_dir_all(&base_dir)?;

        let config_path = base_dir.join(CONFIG_FILE_NAME);
        let config = match StokerConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!("config load failed ({e}), using defaults");
                StokerConfig::default()
            }
        };

        debug!(base = %base_dir.display(), "context initialized");
        Ok(Self {
            config,
            base_dir,
            cwd,
        })
    }

    /// Build a context over an explicit directory and config, bypassing the
    /// home-directory derivation. Used by tests and by embedders that manage
    /// their own layout.
    pub fn with_base_dir(config: StokerConfig, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let cwd = std::env::current_dir()?;
        Ok(Self {
            config,
            base_dir,
            cwd,
        })
    }

    pub fn config(&self) -> &StokerConfig {
        &self.config
    }

    /// Directory holding the database, semaphore and config files.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Working directory the context was derived from. The monitor pins the
    /// worker subprocess here so it derives the same namespace.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn db_path(&self) -> PathBuf {
        self.base_dir.join(&self.config.db_filename)
    }

    pub fn semaphore_path(&self) -> PathBuf {
        self.base_dir.join(SEMAPHORE_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE_NAME)
    }
}

/// Derive the stoker directory for `cwd`: `~/.stoker/<prefix>` with the
/// working directory flattened into the prefix, or `<cwd>/.stoker` when no
/// home directory can be resolved.
fn base_dir_for(home: Option<&Path>, cwd: &Path) -> PathBuf {
    match home {
        Some(home) => {
            let prefix = cwd.to_string_lossy().replace(['/', '\\'], "_");
            home.join(".stoker").join(prefix)
        }
        None => cwd.join(".stoker"),
    }
}
