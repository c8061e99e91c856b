use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_db() -> Result<Connection> {
    let db_path = crate::global::db_file()?;
    open_db(&db_path)
}

pub fn open_db(db_path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let conn = Connection::open(db_path).context("Failed to open database connection")?;

    // The scheduler and every agent process share this file.
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("Failed to set busy timeout")?;
    let _mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .context("Failed to enable WAL journal")?;

    migrate(&conn)?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meeting_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_url TEXT NOT NULL,
            join_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_heartbeat INTEGER,
            recording_path TEXT,
            recording_url TEXT
        )",
        [],
    )
    .context("Failed to create meeting_jobs table")?;

    // Uniqueness is enforced here, not by a pre-check, so concurrent inserts cannot race.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_meeting_jobs_meeting_url ON meeting_jobs(meeting_url)",
        [],
    )
    .context("Failed to create meeting_url unique index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meeting_jobs_due ON meeting_jobs(status, join_at)",
        [],
    )
    .context("Failed to create due-jobs index")?;

    Ok(())
}
