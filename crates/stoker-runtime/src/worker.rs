use std::sync::Arc;

use chrono::Utc;
use stoker_core::Context;
use stoker_cron::compute_next_schedule;
use stoker_store::{Outcome, TaskRecord, TaskStore};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::registry::{HandlerFn, HandlerRegistry};

/// Flag the monitor passes when re-executing the host binary as a worker.
pub const WORKER_FLAG: &str = "--stoker-worker";

/// Worker entry point: open the store, wire up signal handling and drain
/// due tasks until told to stop.
///
/// Every task is claimed under a permit from the shared settings row, so
/// workers across processes never exceed `max_workers` concurrent handler
/// runs. Rows are deleted only after their handler returned, which keeps
/// delivery at-least-once: a worker killed mid-run leaves the row due and
/// the next pass picks it up again.
pub async fn run_worker(ctx: Arc<Context>, registry: HandlerRegistry) -> Result<()> {
    let (tx, rx) = watch::channel(false);
    if let Err(e) = crate::signals::listen(tx) {
        warn!("signal handling unavailable: {e}");
    }
    let store = TaskStore::open(&ctx.db_path())?;
    info!(handlers = registry.len(), "worker started");
    let worker = Worker::new(ctx, store, registry);
    worker.run(rx).await;
    info!("worker stopped");
    // Die by the signal that stopped the loop, now that the loop is done.
    crate::signals::chain();
    Ok(())
}

/// Guard for embedding binaries: when this process was launched by the
/// monitor (the worker flag is on the command line), run the worker loop
/// and report `true` so the caller exits instead of starting its normal
/// duties. Call this before anything else in `main`.
pub async fn run_if_spawned(registry: HandlerRegistry) -> Result<bool> {
    if !std::env::args().any(|arg| arg == WORKER_FLAG) {
        return Ok(false);
    }
    let ctx = Arc::new(Context::initialize()?);
    run_worker(ctx, registry).await?;
    Ok(true)
}

pub struct Worker {
    ctx: Arc<Context>,
    store: TaskStore,
    registry: HandlerRegistry,
}

impl Worker {
    pub fn new(ctx: Arc<Context>, store: TaskStore, registry: HandlerRegistry) -> Self {
        Self {
            ctx,
            store,
            registry,
        }
    }

    /// Poll loop: sweep expired results, run whatever is due, sleep
    /// whenever a pass gets nothing done, whether the table was empty or
    /// every due task had to be deferred. Checks the shutdown flag between
    /// tasks so a long batch cannot stall termination.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let idle = self.ctx.config().worker_idle();
        while !*shutdown.borrow() {
            if !self.drain(&shutdown).await {
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// One polling pass. Returns whether any task reached a terminal
    /// handling; tasks left due for a later pass do not count, so the
    /// caller sleeps instead of re-polling a store it cannot make
    /// progress on.
    async fn drain(&self, shutdown: &watch::Receiver<bool>) -> bool {
        self.sweep_results();

        let due = match self.store.get_tasks_on_due(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                warn!("due query failed: {e}");
                return false;
            }
        };
        let mut progressed = false;
        for task in due {
            if *shutdown.borrow() {
                break;
            }
            progressed |= self.process(task).await;
        }
        progressed
    }

    fn sweep_results(&self) {
        match self.store.delete_outdated_results(Utc::now()) {
            Ok(0) => {}
            Ok(n) => debug!(swept = n, "expired results removed"),
            Err(e) => warn!("result sweep failed: {e}"),
        }
    }

    /// Run one due task end to end. A handler that cannot be resolved is
    /// discarded; a task that cannot get a permit right now is left due
    /// for a later pass. Returns `false` exactly when the task was left
    /// due.
    async fn process(&self, task: TaskRecord) -> bool {
        let Some(handler) = self.registry.resolve(&task.handler) else {
            self.discard_unresolvable(&task);
            return true;
        };
        let permit = match Permit::acquire(&self.store) {
            Ok(Some(permit)) => permit,
            Ok(None) => {
                debug!(id = task.id, "all worker permits taken, deferring");
                return false;
            }
            Err(e) => {
                warn!(id = task.id, "permit acquisition failed: {e}");
                return false;
            }
        };
        debug!(id = task.id, handler = %task.handler, "task starting");
        let outcome = run_handler(&task, handler).await;
        drop(permit);
        self.postprocess(&task, outcome);
        true
    }

    /// A task whose handler name is unknown to this worker can never run.
    /// Settle its result (if one is awaited) and drop the row so it does
    /// not spin on every pass.
    fn discard_unresolvable(&self, task: &TaskRecord) {
        let err = RuntimeError::Resolution {
            handler: task.handler.clone(),
        };
        warn!(id = task.id, "{err}");
        if let Some(uuid) = &task.uuid {
            if let Err(e) = self
                .store
                .update_result(uuid, &Outcome::Failure(err.to_string()))
            {
                warn!(%uuid, "result update failed: {e}");
            }
        }
        if let Err(e) = self.store.delete_callable(task.id) {
            warn!(id = task.id, "task delete failed: {e}");
        }
    }

    /// Store the outcome, then either retire the row or move it to the
    /// next occurrence of its crontab.
    fn postprocess(&self, task: &TaskRecord, outcome: Outcome) {
        if let Outcome::Failure(message) = &outcome {
            warn!(id = task.id, handler = %task.handler, "{message}");
        }
        if let Some(uuid) = &task.uuid {
            match self.store.update_result(uuid, &outcome) {
                Ok(true) => {}
                Ok(false) => debug!(%uuid, "result already settled or reaped"),
                Err(e) => warn!(%uuid, "result update failed: {e}"),
            }
        }
        if task.is_recurring() {
            match compute_next_schedule(&task.crontab, Utc::now()) {
                Ok(next) => {
                    if let Err(e) = self.store.update_schedule(task.id, next) {
                        warn!(id = task.id, "reschedule failed: {e}");
                    }
                }
                // A stored crontab that no longer parses can only repeat
                // the same failure, so retire the row.
                Err(e) => {
                    warn!(id = task.id, "stored crontab rejected: {e}");
                    if let Err(e) = self.store.delete_callable(task.id) {
                        warn!(id = task.id, "task delete failed: {e}");
                    }
                }
            }
        } else if let Err(e) = self.store.delete_callable(task.id) {
            warn!(id = task.id, "task delete failed: {e}");
        }
    }
}

/// Run the handler on the blocking pool; panics and errors both collapse
/// into a failure outcome instead of taking the worker down.
async fn run_handler(task: &TaskRecord, handler: HandlerFn) -> Outcome {
    let args = task.args.clone();
    let joined = tokio::task::spawn_blocking(move || handler(args)).await;
    match joined {
        Ok(Ok(value)) => Outcome::Value(value),
        Ok(Err(e)) => {
            let err = RuntimeError::Execution {
                handler: task.handler.clone(),
                message: format!("{e:#}"),
            };
            Outcome::Failure(err.to_string())
        }
        Err(e) => {
            let message = if e.is_panic() {
                let panic = e.into_panic();
                panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string())
            } else {
                e.to_string()
            };
            let err = RuntimeError::Execution {
                handler: task.handler.clone(),
                message,
            };
            Outcome::Failure(err.to_string())
        }
    }
}

/// One slot in the shared `running_workers` counter, released on drop.
struct Permit<'a> {
    store: &'a TaskStore,
}

impl<'a> Permit<'a> {
    fn acquire(store: &'a TaskStore) -> stoker_store::Result<Option<Self>> {
        Ok(store
            .try_increment_running_workers()?
            .then(|| Self { store }))
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.decrement_running_workers() {
            warn!("permit release failed: {e}");
        }
    }
}
