//! Slowly-changing-dimension (type 2) upserts.
//!
//! Every distinct version of an entity is kept as its own row with a
//! `[valid_from, valid_to)` interval. For a given natural key at most one
//! row has `is_current = 1`; a partial unique index enforces it.
//!
//! Tables are created on first use from the columns observed in the batch.
//! Which tables (and columns) exist is cached per store, so schema
//! introspection only happens when a batch brings a table or column this
//! process has not seen yet.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{format_ts, Pool};
use crate::error::{PersistenceError, Result};

/// One input record: column name to value.
pub type Record = Map<String, Json>;

/// Bookkeeping columns appended to every SCD2 table.
pub const BOOKKEEPING_COLUMNS: [&str; 4] = ["row_hash", "valid_from", "valid_to", "is_current"];

/// A stored version of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Scd2Row {
    /// Key and attribute columns. Absent attributes are `null`.
    pub values: Record,
    pub row_hash: String,
    pub valid_from: String,
    pub valid_to: Option<String>,
    pub is_current: bool,
}

/// Transactional SCD2 engine over the shared SQLite pool.
#[derive(Clone)]
pub struct Scd2Store {
    pool: Pool,
    /// table -> columns known to exist.
    known: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl Scd2Store {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            known: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Upsert `records` keyed by `key_fields`, versioning on every non-key
    /// field. Returns the number of rows inserted.
    pub fn upsert<K: AsRef<str>>(&self, table: &str, records: &[Record], key_fields: &[K]) -> Result<usize> {
        self.upsert_at(table, records, key_fields, None, Utc::now())
    }

    /// Like [`Scd2Store::upsert`] but only `attribute_fields` are stored and
    /// hashed; other fields of the records are ignored.
    pub fn upsert_with_attributes<K: AsRef<str>>(
        &self,
        table: &str,
        records: &[Record],
        key_fields: &[K],
        attribute_fields: &[K],
    ) -> Result<usize> {
        self.upsert_at(table, records, key_fields, Some(attribute_fields), Utc::now())
    }

    /// Full form: explicit attribute list and version instant.
    ///
    /// The whole batch runs in one `BEGIN IMMEDIATE` transaction; any error
    /// rolls everything back.
    pub fn upsert_at<K: AsRef<str>>(
        &self,
        table: &str,
        records: &[Record],
        key_fields: &[K],
        attribute_fields: Option<&[K]>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        validate_identifier(table)?;
        let keys: Vec<&str> = key_fields.iter().map(AsRef::as_ref).collect();
        if keys.is_empty() {
            return Err(PersistenceError::InvalidRecord("no key fields given".into()).into());
        }
        for k in &keys {
            validate_identifier(k)?;
        }
        if records.is_empty() {
            return Ok(0);
        }

        let attributes: Vec<String> = match attribute_fields {
            Some(fields) => fields.iter().map(|f| f.as_ref().to_string()).collect(),
            None => attribute_union(records, &keys),
        };
        for a in &attributes {
            validate_identifier(a)?;
            if BOOKKEEPING_COLUMNS.contains(&a.as_str()) || a == "id" {
                return Err(PersistenceError::InvalidRecord(format!(
                    "field '{}' collides with a bookkeeping column",
                    a
                ))
                .into());
            }
        }

        let prepared = records
            .iter()
            .map(|r| {
                let key_values = key_tuple(r, &keys)?;
                let hash = match attribute_fields {
                    Some(_) => row_hash(r, attributes.iter().map(String::as_str)),
                    None => row_hash(r, r.keys().map(String::as_str).filter(|f| !keys.contains(f))),
                };
                Ok((r, key_values, hash))
            })
            .collect::<Result<Vec<_>>>()?;

        let now_str = format_ts(now);
        let key_filter = keys
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{} = ?{}", quote(k), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let select_current = format!(
            "SELECT id, row_hash FROM {} WHERE {} AND is_current = 1",
            quote(table),
            key_filter
        );
        let close_current = format!(
            "UPDATE {} SET valid_to = ?1, is_current = 0 WHERE id = ?2",
            quote(table)
        );
        let columns: Vec<&str> = keys.iter().copied().chain(attributes.iter().map(String::as_str)).collect();
        let insert_version = format!(
            "INSERT INTO {} ({}, row_hash, valid_from, valid_to, is_current) VALUES ({}, ?, ?, NULL, 1)",
            quote(table),
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            vec!["?"; columns.len()].join(", "),
        );

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let added = self.ensure_table_in(&tx, table, &keys, &attributes)?;

        let mut inserted = 0usize;
        let mut closed = 0usize;
        {
            let mut select = tx.prepare(&select_current)?;
            let mut close = tx.prepare(&close_current)?;
            let mut insert = tx.prepare(&insert_version)?;

            for (record, key_values, hash) in &prepared {
                let current: Option<(i64, String)> = select
                    .query_row(params_from_iter(key_values.iter()), |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()?;

                match current {
                    Some((_, ref current_hash)) if current_hash == hash => continue,
                    Some((id, _)) => {
                        close.execute(rusqlite::params![now_str, id])?;
                        closed += 1;
                    }
                    None => {}
                }

                let mut values: Vec<Option<String>> = key_values.iter().cloned().map(Some).collect();
                values.extend(attributes.iter().map(|a| record.get(a).and_then(text_value)));
                values.push(Some(hash.clone()));
                values.push(Some(now_str.clone()));
                insert.execute(params_from_iter(values.iter()))?;
                inserted += 1;
            }
        }
        tx.commit()?;

        if let Some((table, columns)) = added {
            self.remember(table, columns);
        }

        info!(
            table,
            received = records.len(),
            inserted,
            closed,
            unchanged = records.len() - inserted,
            "scd2 upsert committed"
        );
        Ok(inserted)
    }

    /// Create `table` (or add missing attribute columns) outside of an upsert.
    /// Idempotent.
    pub fn ensure_table<K: AsRef<str>>(&self, table: &str, key_fields: &[K], attribute_fields: &[K]) -> Result<()> {
        validate_identifier(table)?;
        let keys: Vec<&str> = key_fields.iter().map(AsRef::as_ref).collect();
        let attributes: Vec<String> = attribute_fields.iter().map(|a| a.as_ref().to_string()).collect();
        for c in keys.iter().copied().chain(attributes.iter().map(String::as_str)) {
            validate_identifier(c)?;
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let added = self.ensure_table_in(&tx, table, &keys, &attributes)?;
        tx.commit()?;
        if let Some((table, columns)) = added {
            self.remember(table, columns);
        }
        Ok(())
    }

    /// All versions of one entity, oldest first.
    pub fn versions(&self, table: &str, key: &[(&str, &str)]) -> Result<Vec<Scd2Row>> {
        self.select_rows(table, key, false)
    }

    /// The current version of one entity, if any.
    pub fn current(&self, table: &str, key: &[(&str, &str)]) -> Result<Option<Scd2Row>> {
        Ok(self.select_rows(table, key, true)?.into_iter().next())
    }

    /// Number of current rows in `table`.
    pub fn count_current(&self, table: &str) -> Result<usize> {
        validate_identifier(table)?;
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE is_current = 1", quote(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Returns the column set to cache once the transaction commits, or
    /// `None` when the cache already covers this batch.
    fn ensure_table_in(
        &self,
        conn: &Connection,
        table: &str,
        keys: &[&str],
        attributes: &[String],
    ) -> Result<Option<(String, HashSet<String>)>> {
        let wanted: Vec<&str> = keys.iter().copied().chain(attributes.iter().map(String::as_str)).collect();
        {
            let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cols) = known.get(table) {
                if wanted.iter().all(|c| cols.contains(*c)) {
                    return Ok(None);
                }
            }
        }

        let mut existing = table_columns(conn, table)?;
        if existing.is_empty() {
            create_table(conn, table, keys, attributes)?;
            existing = table_columns(conn, table)?;
            info!(table, keys = ?keys, attributes = attributes.len(), "created scd2 table");
        } else {
            if let Some(missing) = keys.iter().find(|k| !existing.contains(**k)) {
                return Err(PersistenceError::InvalidRecord(format!(
                    "table '{}' has no key column '{}'",
                    table, missing
                ))
                .into());
            }
            let missing: Vec<String> = attributes
                .iter()
                .filter(|a| !existing.contains(a.as_str()))
                .cloned()
                .collect();
            for attr in missing {
                conn.execute(
                    &format!("ALTER TABLE {} ADD COLUMN {} TEXT", quote(table), quote(&attr)),
                    [],
                )?;
                info!(table, column = %attr, "added scd2 column");
                existing.insert(attr);
            }
        }
        Ok(Some((table.to_string(), existing)))
    }

    fn remember(&self, table: String, columns: HashSet<String>) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.entry(table).or_default().extend(columns);
    }

    fn select_rows(&self, table: &str, key: &[(&str, &str)], current_only: bool) -> Result<Vec<Scd2Row>> {
        validate_identifier(table)?;
        for (k, _) in key {
            validate_identifier(k)?;
        }
        let mut filter: Vec<String> = key
            .iter()
            .enumerate()
            .map(|(i, (k, _))| format!("{} = ?{}", quote(k), i + 1))
            .collect();
        if current_only {
            filter.push("is_current = 1".into());
        }
        let where_clause = if filter.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", filter.join(" AND "))
        };

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} {} ORDER BY id",
            quote(table),
            where_clause
        ))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(key.iter().map(|(_, v)| *v)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut version = Scd2Row {
                values: Map::new(),
                row_hash: String::new(),
                valid_from: String::new(),
                valid_to: None,
                is_current: false,
            };
            for (i, name) in names.iter().enumerate() {
                match name.as_str() {
                    "id" => {}
                    "row_hash" => version.row_hash = row.get(i)?,
                    "valid_from" => version.valid_from = row.get(i)?,
                    "valid_to" => version.valid_to = row.get(i)?,
                    "is_current" => version.is_current = row.get::<_, i64>(i)? == 1,
                    _ => {
                        let v: Option<String> = row.get(i)?;
                        version.values.insert(name.clone(), v.map(Json::String).unwrap_or(Json::Null));
                    }
                }
            }
            out.push(version);
        }
        Ok(out)
    }
}

/// Stable digest of a record's attributes. Names are sorted before hashing
/// and null values are skipped, so field order and "absent vs null" never
/// produce a new version.
pub fn row_hash<'a>(record: &Record, attributes: impl Iterator<Item = &'a str>) -> String {
    let sorted: BTreeMap<&str, &Json> = attributes
        .filter_map(|name| match record.get(name) {
            None | Some(Json::Null) => None,
            Some(v) => Some((name, v)),
        })
        .collect();

    let mut hasher = Sha256::new();
    for (name, value) in sorted {
        hasher.update(name.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\x1e");
    }
    hex::encode(hasher.finalize())
}

fn attribute_union(records: &[Record], keys: &[&str]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for record in records {
        for name in record.keys() {
            if !keys.contains(&name.as_str()) && seen.insert(name.as_str()) {
                out.push(name.clone());
            }
        }
    }
    out
}

fn key_tuple(record: &Record, keys: &[&str]) -> Result<Vec<String>> {
    keys.iter()
        .map(|k| {
            record.get(*k).and_then(text_value).ok_or_else(|| {
                PersistenceError::InvalidRecord(format!("record is missing key field '{}'", k)).into()
            })
        })
        .collect()
}

/// TEXT representation of a stored value.
fn text_value(value: &Json) -> Option<String> {
    match value {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let cols = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(cols)
}

fn create_table(conn: &Connection, table: &str, keys: &[&str], attributes: &[String]) -> Result<()> {
    let mut columns = vec!["id INTEGER PRIMARY KEY".to_string()];
    columns.extend(keys.iter().map(|k| format!("{} TEXT NOT NULL", quote(k))));
    columns.extend(attributes.iter().map(|a| format!("{} TEXT", quote(a))));
    columns.push("row_hash TEXT NOT NULL".into());
    columns.push("valid_from TEXT NOT NULL".into());
    columns.push("valid_to TEXT".into());
    columns.push("is_current INTEGER NOT NULL CHECK (is_current IN (0, 1))".into());

    let key_list = keys.iter().map(|k| quote(k)).collect::<Vec<_>>().join(", ");
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table_q} ({columns});
         CREATE INDEX IF NOT EXISTS {key_idx} ON {table_q} ({key_list});
         CREATE UNIQUE INDEX IF NOT EXISTS {cur_idx} ON {table_q} ({key_list}) WHERE is_current = 1;",
        table_q = quote(table),
        columns = columns.join(", "),
        key_idx = quote(&format!("idx_{}_key", table)),
        cur_idx = quote(&format!("uq_{}_current", table)),
        key_list = key_list,
    ))?;
    debug!(table, "scd2 indexes ensured");
    Ok(())
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PersistenceError::InvalidIdentifier(name.to_string()).into())
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use chrono::Duration;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Scd2Store) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("scd.db").to_str().unwrap()).unwrap();
        (dir, Scd2Store::new(pool))
    }

    fn rec(v: Json) -> Record {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_hash_ignores_field_order_and_nulls() {
        let a = rec(json!({"id": "1", "name": "x", "size": 3}));
        let b: Record = serde_json::from_str(r#"{"size": 3, "name": "x", "id": "1"}"#).unwrap();
        let c = rec(json!({"id": "1", "name": "x", "size": 3, "note": null}));
        let attrs = |r: &Record| row_hash(r, r.keys().map(String::as_str).filter(|k| *k != "id"));
        assert_eq!(attrs(&a), attrs(&b));
        assert_eq!(attrs(&a), attrs(&c));
        assert_ne!(attrs(&a), attrs(&rec(json!({"id": "1", "name": "x", "size": 4}))));
    }

    #[test]
    fn test_hash_distinguishes_value_types() {
        let n = rec(json!({"v": 1}));
        let s = rec(json!({"v": "1"}));
        assert_ne!(row_hash(&n, ["v"].into_iter()), row_hash(&s, ["v"].into_iter()));
    }

    #[test]
    fn test_first_upsert_inserts_current_row() {
        let (_dir, store) = store();
        let n = store
            .upsert("region", &[rec(json!({"region_cd": "11110", "name": "Jongno"}))], &["region_cd"])
            .unwrap();
        assert_eq!(n, 1);
        let cur = store.current("region", &[("region_cd", "11110")]).unwrap().unwrap();
        assert!(cur.is_current);
        assert_eq!(cur.valid_to, None);
        assert_eq!(cur.values["name"], "Jongno");
    }

    #[test]
    fn test_identical_batch_is_idempotent() {
        let (_dir, store) = store();
        let batch = vec![
            rec(json!({"tx_id": "a", "amount": "10.00", "currency": "KRW"})),
            rec(json!({"tx_id": "b", "amount": "20.00", "currency": "USD"})),
        ];
        assert_eq!(store.upsert("tx", &batch, &["tx_id"]).unwrap(), 2);
        assert_eq!(store.upsert("tx", &batch, &["tx_id"]).unwrap(), 0);
        assert_eq!(store.count_current("tx").unwrap(), 2);
    }

    #[test]
    fn test_reordered_fields_produce_no_version() {
        let (_dir, store) = store();
        let first: Record = serde_json::from_str(r#"{"k":"1","a":"x","b":"y"}"#).unwrap();
        let second: Record = serde_json::from_str(r#"{"b":"y","k":"1","a":"x"}"#).unwrap();
        store.upsert("t", &[first], &["k"]).unwrap();
        assert_eq!(store.upsert("t", &[second], &["k"]).unwrap(), 0);
    }

    #[test]
    fn test_change_closes_previous_version() {
        let (_dir, store) = store();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(60);
        store
            .upsert_at("region", &[rec(json!({"region_cd": "11110", "name": "Jongno"}))], &["region_cd"], None, t0)
            .unwrap();
        let n = store
            .upsert_at("region", &[rec(json!({"region_cd": "11110", "name": "Jongno-gu"}))], &["region_cd"], None, t1)
            .unwrap();
        assert_eq!(n, 1);

        let versions = store.versions("region", &[("region_cd", "11110")]).unwrap();
        assert_eq!(versions.len(), 2);
        assert!(!versions[0].is_current);
        assert_eq!(versions[0].valid_to.as_deref(), Some(format_ts(t1).as_str()));
        assert_eq!(versions[1].valid_from, format_ts(t1));
        assert!(versions[1].is_current);
        assert_eq!(versions[1].values["name"], "Jongno-gu");
    }

    #[test]
    fn test_missing_key_aborts_whole_batch() {
        let (_dir, store) = store();
        let batch = vec![
            rec(json!({"k": "1", "a": "x"})),
            rec(json!({"a": "no key"})),
        ];
        let err = store.upsert("t", &batch, &["k"]).unwrap_err();
        assert!(matches!(
            err,
            crate::IngestError::Persistence(PersistenceError::InvalidRecord(_))
        ));
        // Nothing was written, not even the table.
        assert!(store.count_current("t").is_err());
    }

    #[test]
    fn test_failure_mid_batch_keeps_old_row_current() {
        let (_dir, store) = store();
        store.upsert("t", &[rec(json!({"k": "1", "a": "x"}))], &["k"]).unwrap();

        // The close succeeds, then the insert of the new version aborts.
        let conn = store.pool.get().unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_insert BEFORE INSERT ON t
             BEGIN SELECT RAISE(ABORT, 'insert rejected'); END;",
        )
        .unwrap();
        drop(conn);

        assert!(store.upsert("t", &[rec(json!({"k": "1", "a": "changed"}))], &["k"]).is_err());
        let versions = store.versions("t", &[("k", "1")]).unwrap();
        assert_eq!(versions.len(), 1);
        assert!(versions[0].is_current);
        assert_eq!(versions[0].valid_to, None);
    }

    #[test]
    fn test_new_attribute_adds_column() {
        let (_dir, store) = store();
        store.upsert("t", &[rec(json!({"k": "1", "a": "x"}))], &["k"]).unwrap();
        let n = store
            .upsert("t", &[rec(json!({"k": "1", "a": "x", "b": "new"}))], &["k"])
            .unwrap();
        assert_eq!(n, 1);
        let cur = store.current("t", &[("k", "1")]).unwrap().unwrap();
        assert_eq!(cur.values["b"], "new");
    }

    #[test]
    fn test_several_new_attributes_in_one_batch() {
        let (_dir, store) = store();
        store.upsert("t", &[rec(json!({"k": "1", "a": "x"}))], &["k"]).unwrap();
        let n = store
            .upsert(
                "t",
                &[rec(json!({"k": "1", "a": "x", "b": "1", "c": "2"})), rec(json!({"k": "2", "d": "3"}))],
                &["k"],
            )
            .unwrap();
        assert_eq!(n, 2);
        let second = store.current("t", &[("k", "2")]).unwrap().unwrap();
        assert_eq!(second.values["d"], "3");
        assert!(second.values["b"].is_null());
    }

    #[test]
    fn test_explicit_attributes_ignore_other_fields() {
        let (_dir, store) = store();
        let attrs = ["amount"];
        store
            .upsert_with_attributes("tx", &[rec(json!({"tx_id": "a", "amount": "1", "seen_at": "t0"}))], &["tx_id"], &attrs)
            .unwrap();
        let n = store
            .upsert_with_attributes("tx", &[rec(json!({"tx_id": "a", "amount": "1", "seen_at": "t1"}))], &["tx_id"], &attrs)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_unique_current_index_rejects_second_current_row() {
        let (_dir, store) = store();
        store.upsert("t", &[rec(json!({"k": "1", "a": "x"}))], &["k"]).unwrap();
        let conn = store.pool.get().unwrap();
        let res = conn.execute(
            "INSERT INTO t (k, a, row_hash, valid_from, valid_to, is_current) VALUES ('1', 'y', 'h', 'now', NULL, 1)",
            [],
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_identifiers_validated() {
        let (_dir, store) = store();
        let r = rec(json!({"k": "1"}));
        assert!(store.upsert("bad table", &[r.clone()], &["k"]).is_err());
        assert!(store.upsert("t; DROP TABLE x", &[r.clone()], &["k"]).is_err());
        assert!(store.upsert("t", &[rec(json!({"k": "1", "is_current": 0}))], &["k"]).is_err());
    }

    #[test]
    fn test_concurrent_upserts_keep_single_current_row() {
        let (_dir, store) = store();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let r = rec(json!({"k": "shared", "v": i.to_string()}));
                    store.upsert("race", &[r], &["k"]).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.count_current("race").unwrap(), 1);
        assert_eq!(store.versions("race", &[("k", "shared")]).unwrap().len(), 8);
    }
}
