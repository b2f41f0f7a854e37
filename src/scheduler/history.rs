//! Execution history ledger for scheduled runs.
//!
//! The ledger is append-only: records are inserted and read back, never
//! updated or deleted. The scheduler never consults it to decide due-ness.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, Result};
use crate::storage::{format_ts, Pool};

/// Outcome recorded for one event of a job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Running,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Running => "running",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "running" => Ok(RunStatus::Running),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Row id, set once the record has been read back from the ledger.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub job_name: String,
    pub event_type: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub row_count: u64,
    pub details: Option<serde_json::Value>,
}

impl HistoryRecord {
    /// A record stamped with the current time and no optional fields.
    pub fn new(job_name: impl Into<String>, event_type: impl Into<String>, status: RunStatus) -> Self {
        Self {
            id: None,
            job_name: job_name.into(),
            event_type: event_type.into(),
            status,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            row_count: 0,
            details: None,
        }
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Set `ended_at` and derive `duration_ms` from `started_at`.
    pub fn with_ended_at(mut self, ended_at: DateTime<Utc>) -> Self {
        self.ended_at = Some(ended_at);
        self.duration_ms = Some((ended_at - self.started_at).num_milliseconds().max(0) as u64);
        self
    }

    pub fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = row_count;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(3)?;
        let details: Option<String> = row.get(8)?;
        Ok(Self {
            id: Some(row.get(0)?),
            job_name: row.get(1)?,
            event_type: row.get(2)?,
            status: status.parse().unwrap_or(RunStatus::Failed),
            started_at: parse_ts(row.get::<_, String>(4)?),
            ended_at: row.get::<_, Option<String>>(5)?.map(parse_ts),
            duration_ms: row.get::<_, Option<i64>>(6)?.map(|d| d.max(0) as u64),
            row_count: row.get::<_, Option<i64>>(7)?.unwrap_or(0).max(0) as u64,
            // Details written by other tools may not be JSON; keep them as text.
            details: details.map(|d| {
                serde_json::from_str(&d).unwrap_or(serde_json::Value::String(d))
            }),
        })
    }
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

const SELECT_COLUMNS: &str = "SELECT id, job_name, event_type, status, started_at, ended_at,
        duration_ms, row_count, details FROM ingestion_history";

/// Append-only log of job execution events in `ingestion_history`.
#[derive(Clone)]
pub struct HistoryLedger {
    pool: Pool,
}

impl HistoryLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert one record and return its row id.
    pub fn record(&self, rec: &HistoryRecord) -> Result<i64> {
        let details = rec
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(PersistenceError::from)?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO ingestion_history
             (job_name, event_type, status, started_at, ended_at, duration_ms, row_count, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rec.job_name,
                rec.event_type,
                rec.status.as_str(),
                format_ts(rec.started_at),
                rec.ended_at.map(format_ts),
                rec.duration_ms.map(|d| d as i64),
                rec.row_count as i64,
                details,
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(
            id,
            job = %rec.job_name,
            event = %rec.event_type,
            status = %rec.status,
            "history recorded"
        );
        Ok(id)
    }

    /// Most recent records first.
    pub fn fetch_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1"))?;
        let rows = stmt
            .query_map(params![limit as i64], HistoryRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent records of one job first.
    pub fn for_job(&self, job_name: &str, limit: usize) -> Result<Vec<HistoryRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE job_name = ?1 ORDER BY id DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![job_name, limit as i64], HistoryRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
