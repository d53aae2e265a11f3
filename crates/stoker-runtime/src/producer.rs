//! Enqueue operations used by application code.
//!
//! These write task rows for the worker to pick up. They never run
//! handlers themselves, so they are safe to call from any process that
//! shares the database, supervisor or not.

use chrono::Utc;
use stoker_core::Context;
use stoker_cron::compute_next_schedule;
use stoker_store::{TaskArgs, TaskStore};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Queue a one-shot task, due immediately. Returns the task row id.
pub fn defer(store: &TaskStore, handler: &str, args: &TaskArgs) -> Result<i64> {
    let id = store.register_callable(handler, None, None, "", args)?;
    Ok(id)
}

/// Queue a one-shot task and open a result slot for it. Returns the uuid
/// the caller can poll with [`TaskStore::get_result_by_uuid`].
///
/// The result row is written before the task row. The opposite order
/// would let a fast worker finish the task and find no row to settle,
/// leaving the caller polling a uuid that never resolves.
pub fn defer_with_result(
    ctx: &Context,
    store: &TaskStore,
    handler: &str,
    args: &TaskArgs,
) -> Result<String> {
    let uuid = Uuid::new_v4().to_string();
    let ttl = Utc::now() + ctx.config().result_ttl();
    store.register_result(&uuid, handler, args, ttl)?;
    store.register_callable(handler, Some(&uuid), None, "", args)?;
    Ok(uuid)
}

/// Register a recurring task. Prior recurring rows for the same handler
/// are replaced, so re-registering on every process start converges on a
/// single row per handler. Returns the task row id.
///
/// The crontab is validated before anything is deleted: a malformed
/// expression leaves existing rows exactly as they were.
pub fn schedule_cron(store: &TaskStore, handler: &str, crontab: &str) -> Result<i64> {
    let first = compute_next_schedule(crontab, Utc::now())?;
    for task in store.find_callables(handler)? {
        if task.is_recurring() {
            store.delete_callable(task.id)?;
        }
    }
    let id = store.register_callable(handler, None, Some(first), crontab, &TaskArgs::none())?;
    debug!(id, %first, "recurring task registered");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use stoker_core::StokerConfig;
    use stoker_store::TaskValue;

    use super::*;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().expect("store")
    }

    #[test]
    fn defer_writes_an_immediately_due_one_shot() {
        let store = store();
        let args = TaskArgs::positional([TaskValue::Int(7)]);
        let id = defer(&store, "job", &args).expect("defer");

        let due = store.get_tasks_on_due(Utc::now()).expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].uuid, None);
        assert!(!due[0].is_recurring());
        assert_eq!(due[0].args, args);
    }

    #[test]
    fn defer_with_result_links_task_and_result_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = Context::with_base_dir(StokerConfig::default(), dir.path()).expect("context");
        let store = store();

        let before = Utc::now();
        let uuid = defer_with_result(&ctx, &store, "job", &TaskArgs::none()).expect("defer");
        Uuid::parse_str(&uuid).expect("well-formed uuid");

        let result = store
            .get_result_by_uuid(&uuid)
            .expect("query")
            .expect("row");
        assert!(result.is_waiting());
        assert!(result.ttl >= before + ChronoDuration::seconds(1800));

        let due = store.get_tasks_on_due(Utc::now()).expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uuid.as_deref(), Some(uuid.as_str()));
    }

    #[test]
    fn repeated_cron_registration_converges_on_one_row() {
        let store = store();
        schedule_cron(&store, "report", "10 2 1 * *").expect("register");
        let second = schedule_cron(&store, "report", "10 2 1 * *").expect("register");

        let rows = store.find_callables("report").expect("find");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, second);
        assert_eq!(rows[0].crontab, "10 2 1 * *");
        assert_eq!(
            rows[0].schedule,
            compute_next_schedule("10 2 1 * *", Utc::now()).expect("schedule")
        );
    }

    #[test]
    fn cron_registration_collapses_raw_duplicates() {
        let store = store();
        // Rows left behind by a crashed process that never cleaned up.
        store
            .register_callable("report", None, None, "* * * * *", &TaskArgs::none())
            .expect("raw register");
        store
            .register_callable("report", None, None, "* * * * *", &TaskArgs::none())
            .expect("raw register");

        schedule_cron(&store, "report", "10 2 1 * *").expect("register");

        let rows = store.find_callables("report").expect("find");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].crontab, "10 2 1 * *");
    }

    #[test]
    fn cron_registration_replaces_a_changed_expression() {
        let store = store();
        schedule_cron(&store, "report", "0 0 * * *").expect("register");
        schedule_cron(&store, "report", "30 6 * * *").expect("register");

        let rows = store.find_callables("report").expect("find");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].crontab, "30 6 * * *");
    }

    #[test]
    fn one_shot_rows_survive_cron_registration() {
        let store = store();
        defer(&store, "report", &TaskArgs::none()).expect("defer");
        schedule_cron(&store, "report", "0 12 * * *").expect("register");

        let rows = store.find_callables("report").expect("find");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|t| t.is_recurring()).count(), 1);
    }

    #[test]
    fn malformed_crontab_leaves_the_store_untouched() {
        let store = store();
        let id = schedule_cron(&store, "report", "0 0 * * *").expect("register");

        let err = schedule_cron(&store, "report", "not a crontab");
        assert!(err.is_err());

        let rows = store.find_callables("report").expect("find");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].crontab, "0 0 * * *");
    }
}
