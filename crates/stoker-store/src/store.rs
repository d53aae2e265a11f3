use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::{debug, instrument, warn};

use crate::args::{decode_args, decode_value, encode_args, encode_value, TaskArgs};
use crate::db::init_db;
use crate::error::{Result, StorageError};
use crate::types::{Outcome, ResultRecord, ResultStatus, Settings, TaskRecord};

/// Durable store for pending tasks, result entries and the settings row.
///
/// Wraps a single SQLite connection in a `Mutex`; every operation is one
/// short statement, so the database is never held across an idle interval
/// and the host process and the worker subprocess can share the file.
pub struct TaskStore {
    db: Mutex<Connection>,
}

impl TaskStore {
    /// Wrap an already-open connection, initialising the schema.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::new(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    // --- task rows ---------------------------------------------------------

    /// Insert a task row and return its id.
    ///
    /// `schedule` defaults to now, so a plain delegate call becomes due
    /// immediately. An empty `crontab` marks the task as one-shot.
    #[instrument(skip(self, args), fields(handler = %handler))]
    pub fn register_callable(
        &self,
        handler: &str,
        uuid: Option<&str>,
        schedule: Option<DateTime<Utc>>,
        crontab: &str,
        args: &TaskArgs,
    ) -> Result<i64> {
        let schedule = schedule.unwrap_or_else(Utc::now);
        let blob = encode_args(args);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tasks (uuid, schedule, crontab, handler, args)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![uuid, fmt_ts(schedule), crontab, handler, blob],
        )?;
        let id = db.last_insert_rowid();
        debug!(id, "task registered");
        Ok(id)
    }

    /// Return all rows with `schedule <= now`, soonest first.
    pub fn get_tasks_on_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(
            "SELECT id, uuid, schedule, crontab, handler, args
             FROM tasks WHERE schedule <= ?1 ORDER BY schedule",
        )?;
        let rows = stmt.query_map(rusqlite::params![fmt_ts(now)], read_task_row)?;
        collect_tasks(rows)
    }

    /// Return all rows registered for `handler`, regardless of schedule.
    ///
    /// Used to find and collapse duplicate recurring registrations.
    pub fn find_callables(&self, handler: &str) -> Result<Vec<TaskRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, uuid, schedule, crontab, handler, args
             FROM tasks WHERE handler = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(rusqlite::params![handler], read_task_row)?;
        collect_tasks(rows)
    }

    /// Delete a single task row. Deleting an already-gone row is not an
    /// error; the worker may race a shutdown cleanup here.
    #[instrument(skip(self))]
    pub fn delete_callable(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id])?;
        debug!(deleted = n, "task delete");
        Ok(())
    }

    /// Move a single task row to a new due timestamp.
    #[instrument(skip(self))]
    pub fn update_schedule(&self, id: i64, schedule: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE tasks SET schedule = ?1 WHERE id = ?2",
            rusqlite::params![fmt_ts(schedule), id],
        )?;
        if n == 0 {
            return Err(StorageError::TaskNotFound { id });
        }
        Ok(())
    }

    /// Delete every recurring row (non-empty `crontab`).
    ///
    /// Invoked at startup and shutdown so recurring jobs are freshly
    /// re-derived from the current registrations instead of accumulating
    /// stale duplicates across restarts. Returns the number of rows removed.
    #[instrument(skip(self))]
    pub fn delete_cronjobs(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM tasks WHERE crontab != ''", [])?;
        debug!(deleted = n, "cronjobs cleared");
        Ok(n)
    }

    /// Number of task rows, due or not.
    pub fn count_tasks(&self) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let n = db.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(n)
    }

    // --- result rows -------------------------------------------------------

    /// Insert a result row in `waiting` state.
    ///
    /// Called at the same registration moment as the delegate task so a
    /// consumer polling by uuid never observes a gap.
    #[instrument(skip(self, args), fields(uuid = %uuid))]
    pub fn register_result(
        &self,
        uuid: &str,
        handler: &str,
        args: &TaskArgs,
        ttl: DateTime<Utc>,
    ) -> Result<()> {
        let blob = encode_args(args);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO results (uuid, status, handler, args, value, error_message, ttl)
             VALUES (?1, 'waiting', ?2, ?3, NULL, NULL, ?4)",
            rusqlite::params![uuid, handler, blob, fmt_ts(ttl)],
        )?;
        Ok(())
    }

    /// Record the outcome of a delegate task.
    ///
    /// The row transitions away from `waiting` exactly once; a second call
    /// (or a call for an unknown uuid) changes nothing and returns `false`.
    #[instrument(skip(self, outcome), fields(uuid = %uuid))]
    pub fn update_result(&self, uuid: &str, outcome: &Outcome) -> Result<bool> {
        let (status, value, message) = match outcome {
            Outcome::Value(v) => (ResultStatus::Ready, Some(encode_value(v)), None),
            Outcome::Failure(msg) => (ResultStatus::Error, None, Some(msg.as_str())),
        };
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE results SET status = ?2, value = ?3, error_message = ?4
             WHERE uuid = ?1 AND status = 'waiting'",
            rusqlite::params![uuid, status.to_string(), value, message],
        )?;
        Ok(n == 1)
    }

    /// Fetch a result row, `None` if the uuid is unknown or already reaped.
    pub fn get_result_by_uuid(&self, uuid: &str) -> Result<Option<ResultRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT uuid, status, handler, args, value, error_message, ttl
             FROM results WHERE uuid = ?1",
            rusqlite::params![uuid],
            read_result_row,
        ) {
            Ok(row) => Ok(Some(result_from_row(row)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StorageError::Database(e)),
        }
    }

    /// Remove result rows whose expiry lies strictly in the past.
    #[instrument(skip(self))]
    pub fn delete_outdated_results(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM results WHERE ttl < ?1",
            rusqlite::params![fmt_ts(now)],
        )?;
        if n > 0 {
            debug!(deleted = n, "expired results reaped");
        }
        Ok(n)
    }

    /// Number of result rows, settled or not.
    pub fn count_results(&self) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let n = db.query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?;
        Ok(n)
    }

    // --- settings ----------------------------------------------------------

    /// Read the settings singleton.
    pub fn get_settings(&self) -> Result<Settings> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT max_workers, running_workers FROM settings WHERE id = 1",
            [],
            |row| {
                Ok(Settings {
                    max_workers: row.get(0)?,
                    running_workers: row.get(1)?,
                })
            },
        ) {
            Ok(s) => Ok(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StorageError::SettingsMissing),
            Err(e) => Err(StorageError::Database(e)),
        }
    }

    /// Overwrite the settings singleton. Administrative path only; the
    /// worker adjusts `running_workers` through the permit operations below.
    #[instrument(skip(self))]
    pub fn set_settings(&self, settings: &Settings) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE settings SET max_workers = ?1, running_workers = ?2 WHERE id = 1",
            rusqlite::params![settings.max_workers, settings.running_workers],
        )?;
        if n == 0 {
            return Err(StorageError::SettingsMissing);
        }
        Ok(())
    }

    /// Claim one execution permit.
    ///
    /// Compare and increment in a single statement, so concurrent claimers
    /// can never push `running_workers` past `max_workers`. Returns whether
    /// the permit was granted.
    pub fn try_increment_running_workers(&self) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE settings SET running_workers = running_workers + 1
             WHERE id = 1 AND running_workers < max_workers",
            [],
        )?;
        Ok(n == 1)
    }

    /// Give one execution permit back, never dropping below zero.
    pub fn decrement_running_workers(&self) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE settings SET running_workers = running_workers - 1
             WHERE id = 1 AND running_workers > 0",
            [],
        )?;
        if n == 0 {
            warn!("running_workers already at zero on release");
        }
        Ok(())
    }
}

/// Format a timestamp for a TEXT column so lexicographic order matches
/// chronological order: RFC3339 UTC with fixed microsecond width.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(text)
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {text:?}: {e}")))?;
    Ok(dt.with_timezone(&Utc))
}

type TaskRow = (i64, Option<String>, String, String, String, Vec<u8>);

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?, // id
        row.get(1)?, // uuid
        row.get(2)?, // schedule
        row.get(3)?, // crontab
        row.get(4)?, // handler
        row.get(5)?, // args
    ))
}

fn task_from_row(row: TaskRow) -> Result<TaskRecord> {
    let (id, uuid, schedule, crontab, handler, blob) = row;
    Ok(TaskRecord {
        id,
        uuid,
        schedule: parse_ts(&schedule)?,
        crontab,
        handler,
        args: decode_args(&blob)?,
    })
}

fn collect_tasks(
    rows: impl Iterator<Item = rusqlite::Result<TaskRow>>,
) -> Result<Vec<TaskRecord>> {
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(task_from_row(row?)?);
    }
    Ok(tasks)
}

type ResultRow = (
    String,
    String,
    String,
    Vec<u8>,
    Option<Vec<u8>>,
    Option<String>,
    String,
);

fn read_result_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResultRow> {
    Ok((
        row.get(0)?, // uuid
        row.get(1)?, // status
        row.get(2)?, // handler
        row.get(3)?, // args
        row.get(4)?, // value
        row.get(5)?, // error_message
        row.get(6)?, // ttl
    ))
}

fn result_from_row(row: ResultRow) -> Result<ResultRecord> {
    let (uuid, status, handler, args, value, error_message, ttl) = row;
    Ok(ResultRecord {
        uuid,
        status: status
            .parse()
            .map_err(|e: String| StorageError::Corrupt(e))?,
        handler,
        args: decode_args(&args)?,
        value: value.as_deref().map(decode_value).transpose()?,
        error_message,
        ttl: parse_ts(&ttl)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::args::TaskValue;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().expect("in-memory store")
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 25, h, m, s).unwrap()
    }

    #[test]
    fn due_query_returns_exactly_the_due_set() {
        let store = store();
        let now = at(12, 0, 0);
        store
            .register_callable("a", None, Some(now + Duration::seconds(10)), "", &TaskArgs::none())
            .unwrap();
        store
            .register_callable("b", None, Some(now), "", &TaskArgs::none())
            .unwrap();

        let due = store.get_tasks_on_due(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].handler, "b");

        let due = store.get_tasks_on_due(now + Duration::seconds(10)).unwrap();
        let handlers: Vec<_> = due.iter().map(|t| t.handler.as_str()).collect();
        // Ascending by schedule: b (earlier) before a.
        assert_eq!(handlers, vec!["b", "a"]);
    }

    #[test]
    fn register_defaults_to_an_immediately_due_one_shot() {
        let store = store();
        let id = store
            .register_callable("now_task", None, None, "", &TaskArgs::none())
            .unwrap();
        let due = store.get_tasks_on_due(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert!(!due[0].is_recurring());
        assert!(due[0].uuid.is_none());
    }

    #[test]
    fn arguments_round_trip_through_storage() {
        let store = store();
        let args = TaskArgs {
            positional: vec![TaskValue::Map(vec![
                (TaskValue::Int(10), TaskValue::Text("ten".into())),
                (TaskValue::Bool(true), TaskValue::Float(0.5)),
            ])],
            keyword: vec![("depth".to_string(), TaskValue::Int(3))],
        };
        store
            .register_callable("echo", None, Some(at(1, 0, 0)), "", &args)
            .unwrap();
        let fetched = store.get_tasks_on_due(at(1, 0, 0)).unwrap();
        assert_eq!(fetched[0].args, args);
    }

    #[test]
    fn find_callables_filters_by_handler() {
        let store = store();
        store
            .register_callable("f", None, Some(at(23, 0, 0)), "* * * * *", &TaskArgs::none())
            .unwrap();
        store
            .register_callable("g", None, None, "", &TaskArgs::none())
            .unwrap();
        let found = store.find_callables("f").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].crontab, "* * * * *");
        assert!(store.find_callables("missing").unwrap().is_empty());
    }

    #[test]
    fn delete_callable_is_silent_for_missing_rows() {
        let store = store();
        let id = store
            .register_callable("f", None, None, "", &TaskArgs::none())
            .unwrap();
        store.delete_callable(id).unwrap();
        assert!(store.get_tasks_on_due(Utc::now()).unwrap().is_empty());
        // A second delete of the same id is a no-op.
        store.delete_callable(id).unwrap();
    }

    #[test]
    fn update_schedule_moves_a_row_and_rejects_unknown_ids() {
        let store = store();
        let id = store
            .register_callable("f", None, Some(at(10, 0, 0)), "", &TaskArgs::none())
            .unwrap();
        store.update_schedule(id, at(11, 30, 0)).unwrap();
        assert!(store.get_tasks_on_due(at(11, 0, 0)).unwrap().is_empty());
        assert_eq!(store.get_tasks_on_due(at(11, 30, 0)).unwrap().len(), 1);

        let err = store.update_schedule(9999, at(12, 0, 0)).unwrap_err();
        assert!(matches!(err, StorageError::TaskNotFound { id: 9999 }));
    }

    #[test]
    fn delete_cronjobs_spares_one_shot_rows() {
        let store = store();
        store
            .register_callable("cron_a", None, None, "* * * * *", &TaskArgs::none())
            .unwrap();
        store
            .register_callable("cron_b", None, None, "10 2 1 * *", &TaskArgs::none())
            .unwrap();
        store
            .register_callable("oneshot", None, None, "", &TaskArgs::none())
            .unwrap();

        assert_eq!(store.delete_cronjobs().unwrap(), 2);
        let remaining = store.get_tasks_on_due(Utc::now()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].handler, "oneshot");
        // Nothing recurring left to remove.
        assert_eq!(store.delete_cronjobs().unwrap(), 0);
    }

    #[test]
    fn result_lifecycle_transitions_exactly_once() {
        let store = store();
        let ttl = at(23, 59, 59);
        store
            .register_result("uuid-1", "f", &TaskArgs::none(), ttl)
            .unwrap();

        let waiting = store.get_result_by_uuid("uuid-1").unwrap().unwrap();
        assert!(waiting.is_waiting());
        assert_eq!(waiting.ttl, ttl);

        let outcome = Outcome::Value(TaskValue::Int(41));
        assert!(store.update_result("uuid-1", &outcome).unwrap());
        let ready = store.get_result_by_uuid("uuid-1").unwrap().unwrap();
        assert!(ready.is_ready());
        assert_eq!(ready.value, Some(TaskValue::Int(41)));

        // A second transition attempt changes nothing.
        let late = Outcome::Failure("too late".into());
        assert!(!store.update_result("uuid-1", &late).unwrap());
        let still = store.get_result_by_uuid("uuid-1").unwrap().unwrap();
        assert!(still.is_ready());
        assert_eq!(still.value, Some(TaskValue::Int(41)));
    }

    #[test]
    fn failures_are_recorded_with_their_message() {
        let store = store();
        store
            .register_result("uuid-2", "f", &TaskArgs::none(), at(23, 0, 0))
            .unwrap();
        let outcome = Outcome::Failure("handler exploded".into());
        assert!(store.update_result("uuid-2", &outcome).unwrap());
        let row = store.get_result_by_uuid("uuid-2").unwrap().unwrap();
        assert!(row.has_error());
        assert_eq!(row.error_message.as_deref(), Some("handler exploded"));
        assert_eq!(row.value, None);
    }

    #[test]
    fn updating_an_unknown_uuid_reports_false() {
        let store = store();
        let outcome = Outcome::Value(TaskValue::None);
        assert!(!store.update_result("ghost", &outcome).unwrap());
        assert!(store.get_result_by_uuid("ghost").unwrap().is_none());
    }

    #[test]
    fn ttl_sweep_only_removes_strictly_expired_rows() {
        let store = store();
        let now = at(12, 0, 0);
        store
            .register_result("old", "f", &TaskArgs::none(), now - Duration::seconds(1))
            .unwrap();
        store
            .register_result("edge", "f", &TaskArgs::none(), now)
            .unwrap();
        store
            .register_result("fresh", "f", &TaskArgs::none(), now + Duration::seconds(1))
            .unwrap();

        assert_eq!(store.delete_outdated_results(now).unwrap(), 1);
        assert!(store.get_result_by_uuid("old").unwrap().is_none());
        // A ttl equal to now has not expired yet.
        assert!(store.get_result_by_uuid("edge").unwrap().is_some());
        assert!(store.get_result_by_uuid("fresh").unwrap().is_some());
    }

    #[test]
    fn settings_start_at_the_defaults() {
        let store = store();
        assert_eq!(store.get_settings().unwrap(), Settings::default());
    }

    #[test]
    fn set_settings_round_trips() {
        let store = store();
        let wanted = Settings {
            max_workers: 4,
            running_workers: 0,
        };
        store.set_settings(&wanted).unwrap();
        assert_eq!(store.get_settings().unwrap(), wanted);
    }

    #[test]
    fn permits_are_capped_and_floored() {
        let store = store();
        // Default cap is one permit.
        assert!(store.try_increment_running_workers().unwrap());
        assert!(!store.try_increment_running_workers().unwrap());
        assert_eq!(store.get_settings().unwrap().running_workers, 1);

        store.decrement_running_workers().unwrap();
        assert_eq!(store.get_settings().unwrap().running_workers, 0);
        // Releasing below zero is absorbed.
        store.decrement_running_workers().unwrap();
        assert_eq!(store.get_settings().unwrap().running_workers, 0);
    }

    #[test]
    fn raising_the_cap_frees_more_permits() {
        let store = store();
        store
            .set_settings(&Settings {
                max_workers: 2,
                running_workers: 0,
            })
            .unwrap();
        assert!(store.try_increment_running_workers().unwrap());
        assert!(store.try_increment_running_workers().unwrap());
        assert!(!store.try_increment_running_workers().unwrap());
        let settings = store.get_settings().unwrap();
        assert_eq!(settings.running_workers, 2);
        assert_eq!(settings.max_workers, 2);
    }

    #[test]
    fn counts_cover_all_rows_regardless_of_state() {
        let store = store();
        assert_eq!(store.count_tasks().unwrap(), 0);
        assert_eq!(store.count_results().unwrap(), 0);

        store
            .register_callable("a", None, Some(at(23, 0, 0)), "", &TaskArgs::none())
            .unwrap();
        store
            .register_callable("b", None, None, "* * * * *", &TaskArgs::none())
            .unwrap();
        store
            .register_result("u", "a", &TaskArgs::none(), at(12, 0, 0))
            .unwrap();

        assert_eq!(store.count_tasks().unwrap(), 2);
        assert_eq!(store.count_results().unwrap(), 1);
    }
}
