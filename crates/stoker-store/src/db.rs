use rusqlite::Connection;

use crate::error::Result;
use crate::types::Settings;

/// Initialise the task, result and settings tables plus their indexes.
///
/// Safe to call on every startup, uses `IF NOT EXISTS` throughout. The
/// settings row is seeded once and survives later calls untouched.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id        INTEGER PRIMARY KEY,
            uuid      TEXT,                    -- correlation id, NULL without a result row
            schedule  TEXT    NOT NULL,        -- RFC3339 UTC, fixed width
            crontab   TEXT    NOT NULL DEFAULT '',
            handler   TEXT    NOT NULL,
            args      BLOB    NOT NULL
        ) STRICT;

        -- Polling: SELECT ... WHERE schedule <= ? ORDER BY schedule
        CREATE INDEX IF NOT EXISTS idx_tasks_schedule ON tasks (schedule);
        -- Cron re-registration looks rows up by handler name
        CREATE INDEX IF NOT EXISTS idx_tasks_handler ON tasks (handler);

        CREATE TABLE IF NOT EXISTS results (
            uuid          TEXT NOT NULL PRIMARY KEY,
            status        TEXT NOT NULL DEFAULT 'waiting',
            handler       TEXT NOT NULL,
            args          BLOB NOT NULL,
            value         BLOB,
            error_message TEXT,
            ttl           TEXT NOT NULL        -- RFC3339 UTC expiry
        ) STRICT;

        -- TTL sweep: DELETE ... WHERE ttl < ?
        CREATE INDEX IF NOT EXISTS idx_results_ttl ON results (ttl);

        -- Single-row table; the CHECK pins the row id so every writer
        -- addresses the same row.
        CREATE TABLE IF NOT EXISTS settings (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            max_workers     INTEGER NOT NULL,
            running_workers INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    let defaults = Settings::default();
    conn.execute(
        "INSERT OR IGNORE INTO settings (id, max_workers, running_workers) VALUES (1, ?1, ?2)",
        rusqlite::params![defaults.max_workers, defaults.running_workers],
    )?;
    Ok(())
}
