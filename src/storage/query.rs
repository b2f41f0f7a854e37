//! Raw SQL passthrough for ad hoc reads (and the occasional write).

use rusqlite::types::{Value, ValueRef};
use serde_json::{Map, Number, Value as Json};

use super::Pool;
use crate::error::Result;

/// A result row keyed by column name.
pub type QueryRow = Map<String, Json>;

/// Run `sql` with positional `params`. Statements that return columns yield
/// their rows; anything else is executed and yields no rows.
pub fn execute_query(pool: &Pool, sql: &str, params: &[Json]) -> Result<Vec<QueryRow>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(sql)?;
    let bound: Vec<Value> = params.iter().map(json_to_sql).collect();

    if stmt.column_count() == 0 {
        stmt.execute(rusqlite::params_from_iter(bound.iter()))?;
        return Ok(Vec::new());
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            map.insert(name.clone(), sql_to_json(row.get_ref(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

/// Bind a JSON value as a SQLite value. Arrays and objects are bound as JSON
/// text.
pub(crate) fn json_to_sql(value: &Json) -> Value {
    match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Integer(i64::from(*b)),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Json {
    match value {
        ValueRef::Null => Json::Null,
        ValueRef::Integer(i) => Json::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Json::Number).unwrap_or(Json::Null),
        ValueRef::Text(t) => Json::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Json::String(hex::encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use serde_json::json;

    #[test]
    fn test_select_returns_named_columns() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("q.db").to_str().unwrap()).unwrap();

        execute_query(&pool, "CREATE TABLE t (a INTEGER, b TEXT, c REAL)", &[]).unwrap();
        let written = execute_query(
            &pool,
            "INSERT INTO t (a, b, c) VALUES (?1, ?2, ?3)",
            &[json!(7), json!("seven"), json!(7.5)],
        )
        .unwrap();
        assert!(written.is_empty());

        let rows = execute_query(&pool, "SELECT a, b, c FROM t WHERE a = ?1", &[json!(7)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["a"], 7);
        assert_eq!(rows[0]["b"], "seven");
        assert_eq!(rows[0]["c"], 7.5);
    }

    #[test]
    fn test_bad_sql_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("q.db").to_str().unwrap()).unwrap();
        let err = execute_query(&pool, "SELEC nonsense", &[]).unwrap_err();
        assert!(matches!(err, crate::IngestError::Persistence(_)));
    }
}
