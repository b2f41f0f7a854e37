//! The manager context handed to every job invocation.
//!
//! Built once at startup and shared by reference; it is the only way jobs
//! reach persistence and secrets.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::error::{IngestError, Result};
use crate::scheduler::history::{HistoryLedger, HistoryRecord, RunStatus};
use crate::secrets::KeyProvider;
use crate::storage::query::QueryRow;
use crate::storage::scd2::Record;
use crate::storage::{execute_query, Pool, Scd2Store};

pub struct ManagerContext {
    pool: Pool,
    scd2: Scd2Store,
    ledger: HistoryLedger,
    keys: Arc<dyn KeyProvider>,
}

impl ManagerContext {
    pub fn new(pool: Pool, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            scd2: Scd2Store::new(pool.clone()),
            ledger: HistoryLedger::new(pool.clone()),
            pool,
            keys,
        }
    }

    /// Resolve a named API key.
    pub fn get_api_key(&self, name: &str) -> Result<String> {
        match self.keys.lookup(name) {
            Some(value) => Ok(value.as_str().to_owned()),
            None => {
                warn!(key = %name, "API key lookup failed");
                Err(IngestError::KeyLookup(name.to_string()))
            }
        }
    }

    /// Append a job event to the history ledger.
    pub fn log_history(
        &self,
        job_name: &str,
        event_type: &str,
        status: RunStatus,
        row_count: u64,
        details: Option<Value>,
    ) -> Result<i64> {
        let mut record = HistoryRecord::new(job_name, event_type, status).with_row_count(row_count);
        record.details = details;
        self.ledger.record(&record)
    }

    /// SCD2 upsert keyed by `key_fields`; returns rows inserted.
    pub fn upsert_scd2<K: AsRef<str>>(&self, table: &str, records: &[Record], key_fields: &[K]) -> Result<usize> {
        self.scd2.upsert(table, records, key_fields)
    }

    /// SCD2 upsert restricted to an explicit attribute list.
    pub fn upsert_scd2_with_attributes<K: AsRef<str>>(
        &self,
        table: &str,
        records: &[Record],
        key_fields: &[K],
        attribute_fields: &[K],
    ) -> Result<usize> {
        self.scd2
            .upsert_with_attributes(table, records, key_fields, attribute_fields)
    }

    /// Raw SQL passthrough for ad hoc reads.
    pub fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<QueryRow>> {
        execute_query(&self.pool, sql, params)
    }

    pub fn ledger(&self) -> &HistoryLedger {
        &self.ledger
    }

    pub fn scd2(&self) -> &Scd2Store {
        &self.scd2
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}
