//! Database schema and migrations.
//!
//! Only the fixed tables live here. SCD2 tables are created on demand by
//! [`super::scd2::Scd2Store`] because their columns come from the data.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS ingestion_history (
            id INTEGER PRIMARY KEY,
            job_name TEXT NOT NULL,
            event_type TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            duration_ms INTEGER,
            row_count INTEGER NOT NULL DEFAULT 0,
            details TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_ingestion_history_job ON ingestion_history(job_name);
        CREATE INDEX IF NOT EXISTS idx_ingestion_history_started ON ingestion_history(started_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
