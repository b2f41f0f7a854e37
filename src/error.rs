//! Error taxonomy shared by the scheduler and the storage layer.
//!
//! Configuration-time variants (`ScheduleParse`, `CyclicDependency`,
//! `UnknownDependency`, `DuplicateJob`, `UnregisteredJob`) abort startup.
//! Everything else is contained at job granularity by the orchestrator.

use thiserror::Error;

/// Failures raised by the SQLite-backed stores.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Could not check a connection out of the pool.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A table or column name is not a plain SQL identifier.
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// A record cannot be versioned (missing key, non-object, ...).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A JSON payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Top-level error type of the ingestion manager.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A recurrence rule is malformed or never fires.
    #[error("invalid schedule for job '{job}': {reason}")]
    ScheduleParse { job: String, reason: String },

    /// The `depends_on` graph contains a cycle.
    #[error("cyclic dependency detected involving job '{0}'")]
    CyclicDependency(String),

    /// A `depends_on` entry names a job that is not in the schedule.
    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    /// Two schedule entries share a name.
    #[error("duplicate job name '{0}'")]
    DuplicateJob(String),

    /// An enabled schedule entry has no registered implementation.
    #[error("job '{0}' is scheduled but not registered")]
    UnregisteredJob(String),

    /// A job callable returned an error or panicked.
    #[error("job '{job}' failed: {message}")]
    JobExecution { job: String, message: String },

    /// A transactional write or read failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A secret lookup found nothing under the requested name.
    #[error("API key '{0}' not found")]
    KeyLookup(String),
}

impl IngestError {
    /// Shorthand for a [`IngestError::ScheduleParse`] bound to a job name.
    pub fn schedule(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ScheduleParse {
            job: job.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that must abort startup rather than be contained.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            Self::ScheduleParse { .. }
                | Self::CyclicDependency(_)
                | Self::UnknownDependency { .. }
                | Self::DuplicateJob(_)
                | Self::UnregisteredJob(_)
        )
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(PersistenceError::Sqlite(e))
    }
}

impl From<r2d2::Error> for IngestError {
    fn from(e: r2d2::Error) -> Self {
        Self::Persistence(PersistenceError::Pool(e))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
