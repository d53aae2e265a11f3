use std::sync::Arc;
use std::time::{Duration, Instant};

use stoker_core::Context;
use stoker_store::TaskStore;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::remove_semaphore;
use crate::signals;
use crate::worker::WORKER_FLAG;

/// Grace period between SIGTERM and a hard kill of the worker.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Keeps exactly one worker subprocess alive.
///
/// The loop spawns a worker whenever none is running, then parks on the
/// shutdown channel with a bounded wait. A worker crash is transient: the
/// next tick respawns it, with the wait stretched while the worker keeps
/// dying right after starting.
pub struct Monitor {
    ctx: Arc<Context>,
}

impl Monitor {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Run until `shutdown` flips to `true`, then terminate the worker,
    /// release the semaphore marker and chain the signal that drove the
    /// shutdown, if one did.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let idle = self.ctx.config().monitor_idle();
        let mut child: Option<Child> = None;
        let mut last_spawn: Option<Instant> = None;
        let mut quick_exits: u32 = 0;
        info!("worker monitor started");

        loop {
            if !is_alive(&mut child) {
                match last_spawn {
                    // Dying within two idle periods of its spawn counts as
                    // a crash loop.
                    Some(t) if t.elapsed() < idle.saturating_mul(2) => {
                        quick_exits = quick_exits.saturating_add(1);
                    }
                    Some(_) => quick_exits = 0,
                    None => {}
                }
                match self.spawn_worker() {
                    Ok(c) => {
                        info!(pid = c.id(), "worker spawned");
                        child = Some(c);
                        last_spawn = Some(Instant::now());
                    }
                    Err(e) => {
                        warn!("worker spawn failed: {e}");
                        last_spawn = None;
                        quick_exits = quick_exits.saturating_add(1);
                    }
                }
            }

            let wait = backoff_wait(idle, quick_exits);
            if quick_exits > 0 {
                debug!(
                    failures = quick_exits,
                    wait_ms = wait.as_millis() as u64,
                    "worker restart damped"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(c) = child.take() {
            terminate_worker(c).await;
        }
        self.clear_recurring_rows();
        remove_semaphore(&self.ctx.semaphore_path());
        info!("worker monitor stopped");
        // On a signal-driven shutdown the host process must still die by
        // that signal once cleanup is done.
        signals::chain();
    }

    /// Recurring rows belong to the registrations of a live process; the
    /// next startup re-creates them, stale ones must not linger.
    fn clear_recurring_rows(&self) {
        match TaskStore::open(&self.ctx.db_path()) {
            Ok(store) => {
                if let Err(e) = store.delete_cronjobs() {
                    warn!("cronjob cleanup failed: {e}");
                }
            }
            Err(e) => warn!("cronjob cleanup skipped: {e}"),
        }
    }

    /// Build the worker command: the configured override, or this same
    /// binary re-executed with the worker flag.
    fn spawn_worker(&self) -> std::io::Result<Child> {
        let worker = &self.ctx.config().worker;
        let mut cmd = match &worker.program {
            Some(program) => Command::new(program),
            None => {
                let mut cmd = Command::new(std::env::current_exe()?);
                cmd.arg(WORKER_FLAG);
                cmd
            }
        };
        cmd.args(&worker.args);
        // The worker derives its database namespace from its working
        // directory, so it must inherit ours.
        cmd.current_dir(self.ctx.cwd());
        cmd.spawn()
    }
}

/// `true` while the subprocess exists and has not exited.
fn is_alive(child: &mut Option<Child>) -> bool {
    let Some(c) = child else { return false };
    match c.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            debug!(%status, "worker exited");
            *child = None;
            false
        }
        Err(e) => {
            warn!("worker status check failed: {e}");
            *child = None;
            false
        }
    }
}

/// Crash-loop damper: double the idle wait per consecutive quick exit,
/// capped at one minute (or the idle interval itself when that is longer).
fn backoff_wait(idle: Duration, quick_exits: u32) -> Duration {
    if quick_exits == 0 {
        return idle;
    }
    let factor = 1u32 << quick_exits.min(5);
    let cap = idle.max(Duration::from_secs(60));
    idle.saturating_mul(factor).min(cap)
}

/// SIGTERM first so the worker can finish its current iteration, hard
/// kill if it lingers past the grace period.
async fn terminate_worker(mut child: Child) {
    if let Some(pid) = child.id() {
        // Safety: pid is our direct child, still attached to this handle.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "worker terminated");
                return;
            }
            Ok(Err(e)) => warn!("worker wait failed: {e}"),
            Err(_) => warn!("worker ignored SIGTERM"),
        }
    }
    if let Err(e) = child.kill().await {
        warn!("worker kill failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use stoker_core::StokerConfig;

    use super::*;

    #[test]
    fn backoff_starts_at_the_idle_interval() {
        let idle = Duration::from_secs(2);
        assert_eq!(backoff_wait(idle, 0), idle);
    }

    #[test]
    fn backoff_doubles_per_quick_exit_and_caps() {
        let idle = Duration::from_secs(2);
        assert_eq!(backoff_wait(idle, 1), Duration::from_secs(4));
        assert_eq!(backoff_wait(idle, 3), Duration::from_secs(16));
        assert_eq!(backoff_wait(idle, 5), Duration::from_secs(60));
        assert_eq!(backoff_wait(idle, 30), Duration::from_secs(60));
    }

    #[test]
    fn backoff_never_shrinks_a_long_idle() {
        let idle = Duration::from_secs(90);
        assert_eq!(backoff_wait(idle, 0), idle);
        assert_eq!(backoff_wait(idle, 4), idle);
    }

    #[tokio::test]
    async fn terminate_stops_a_live_worker() {
        let child = Command::new("sleep").arg("30").spawn().expect("spawn");
        let started = Instant::now();
        terminate_worker(child).await;
        assert!(started.elapsed() < TERMINATE_GRACE);
    }

    #[tokio::test]
    async fn monitor_respawns_dead_workers_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("spawns");

        let mut config = StokerConfig::default();
        config.monitor_idle_secs = 0.05;
        config.worker.program = Some("sh".to_string());
        config.worker.args = vec![
            "-c".to_string(),
            format!("echo spawned >> {}", marker.display()),
        ];
        let ctx = Arc::new(Context::with_base_dir(config, dir.path()).expect("context"));
        std::fs::write(ctx.semaphore_path(), b"").expect("marker");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Monitor::new(Arc::clone(&ctx)).run(rx));
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor stopped")
            .expect("monitor task");

        let spawns = std::fs::read_to_string(&marker).expect("spawn log");
        // The short-lived worker exited repeatedly and was brought back.
        assert!(spawns.lines().count() >= 2, "spawns: {spawns:?}");
        assert!(!ctx.semaphore_path().exists());
    }
}
