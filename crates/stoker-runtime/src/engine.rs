use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stoker_core::Context;
use stoker_store::TaskStore;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::monitor::Monitor;
use crate::signals;

/// Supervisor entry point for the host process.
///
/// At most one engine per working directory may supervise a worker. The
/// claim is a marker file created with create-new semantics; losing that
/// race means another host process already runs the show, and [`start`]
/// reports `false` instead of erroring.
///
/// [`start`]: Engine::start
pub struct Engine {
    ctx: Arc<Context>,
    shutdown_tx: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    owns_lock: AtomicBool,
}

impl Engine {
    pub fn new(ctx: Arc<Context>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            shutdown_tx,
            monitor: Mutex::new(None),
            owns_lock: AtomicBool::new(false),
        }
    }

    /// Start the supervisor. Returns whether it actually started.
    ///
    /// `false` covers every refusal: the feature is switched off, another
    /// instance holds the semaphore, or the store is unusable. The host
    /// application simply continues without background execution.
    pub async fn start(&self) -> bool {
        if !self.ctx.config().active {
            debug!("engine disabled by configuration");
            return false;
        }
        if !acquire_semaphore(&self.ctx.semaphore_path()) {
            return false;
        }
        self.owns_lock.store(true, Ordering::SeqCst);

        // Probe the database up front; a worker would only hit the same
        // failure later and flap.
        if let Err(e) = TaskStore::open(&self.ctx.db_path()) {
            warn!("store unusable, engine not started: {e}");
            self.release_lock();
            return false;
        }

        if let Err(e) = signals::listen(self.shutdown_tx.clone()) {
            warn!("signal listeners not installed: {e}");
        }

        // Reset the channel in case this engine was stopped before.
        let _ = self.shutdown_tx.send(false);
        let monitor = Monitor::new(Arc::clone(&self.ctx));
        let handle = tokio::spawn(monitor.run(self.shutdown_tx.subscribe()));
        *self.monitor.lock().await = Some(handle);
        info!(base = %self.ctx.base_dir().display(), "supervisor started");
        true
    }

    /// Request shutdown and wait for the monitor to clean up.
    ///
    /// Idempotent; without a prior successful [`start`](Engine::start) it
    /// leaves the filesystem and the store alone, so it never disturbs a
    /// supervisor owned by another process.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("monitor task failed: {e}");
            }
        }
        if self.owns_lock.swap(false, Ordering::SeqCst) {
            // The monitor does the same cleanup on its way out; repeating
            // it here covers the paths where it never got to run.
            remove_semaphore(&self.ctx.semaphore_path());
            match TaskStore::open(&self.ctx.db_path()) {
                Ok(store) => {
                    if let Err(e) = store.delete_cronjobs() {
                        warn!("cronjob cleanup failed: {e}");
                    }
                }
                Err(e) => warn!("cronjob cleanup skipped: {e}"),
            }
            info!("supervisor stopped");
        }
    }

    fn release_lock(&self) {
        if self.owns_lock.swap(false, Ordering::SeqCst) {
            remove_semaphore(&self.ctx.semaphore_path());
        }
    }
}

/// Atomically create the marker file. `false` means another instance is
/// active, or the path is unusable.
fn acquire_semaphore(path: &Path) -> bool {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(_) => {
            debug!(path = %path.display(), "semaphore acquired");
            true
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            info!(path = %path.display(), "another supervisor instance is active");
            false
        }
        Err(e) => {
            warn!("semaphore creation failed: {e}");
            false
        }
    }
}

/// Delete the marker file. A missing file is fine; a crash before `stop`
/// leaves it behind, and an operator has to clear that by hand.
pub(crate) fn remove_semaphore(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "semaphore released"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("semaphore removal failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use stoker_core::StokerConfig;
    use stoker_store::TaskArgs;

    use super::*;

    /// Config whose monitor spawns a harmless long sleep instead of
    /// re-executing the test binary.
    fn sleeper_config() -> StokerConfig {
        let mut config = StokerConfig::default();
        config.worker.program = Some("sleep".to_string());
        config.worker.args = vec!["30".to_string()];
        config
    }

    fn engine_in(dir: &tempfile::TempDir, config: StokerConfig) -> Engine {
        let ctx = Context::with_base_dir(config, dir.path()).expect("context");
        Engine::new(Arc::new(ctx))
    }

    #[tokio::test]
    async fn start_claims_the_semaphore_and_stop_releases_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_in(&dir, sleeper_config());

        assert!(engine.start().await);
        assert!(engine.ctx.semaphore_path().exists());

        engine.stop().await;
        assert!(!engine.ctx.semaphore_path().exists());
    }

    #[tokio::test]
    async fn second_start_loses_the_race() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_in(&dir, sleeper_config());

        assert!(engine.start().await);
        assert!(!engine.start().await);
        engine.stop().await;
    }

    #[tokio::test]
    async fn inactive_configuration_refuses_to_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = sleeper_config();
        config.active = false;
        let engine = engine_in(&dir, config);

        assert!(!engine.start().await);
        assert!(!engine.ctx.semaphore_path().exists());
    }

    #[tokio::test]
    async fn stale_semaphore_blocks_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_in(&dir, sleeper_config());
        std::fs::write(engine.ctx.semaphore_path(), b"").expect("marker");

        assert!(!engine.start().await);
        // The stale marker is an operator problem, not silently healed.
        assert!(engine.ctx.semaphore_path().exists());
    }

    #[tokio::test]
    async fn stop_without_start_leaves_foreign_state_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_in(&dir, sleeper_config());
        // Marker held by some other process.
        std::fs::write(engine.ctx.semaphore_path(), b"").expect("marker");

        engine.stop().await;
        assert!(engine.ctx.semaphore_path().exists());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_clears_recurring_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_in(&dir, sleeper_config());

        let store = TaskStore::open(&engine.ctx.db_path()).expect("store");
        store
            .register_callable("beat", None, None, "* * * * *", &TaskArgs::none())
            .unwrap();
        store
            .register_callable("once", None, None, "", &TaskArgs::none())
            .unwrap();
        drop(store);

        assert!(engine.start().await);
        engine.stop().await;
        engine.stop().await;

        let store = TaskStore::open(&engine.ctx.db_path()).expect("store");
        assert!(store.find_callables("beat").unwrap().is_empty());
        assert_eq!(store.find_callables("once").unwrap().len(), 1);
    }
}
