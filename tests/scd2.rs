//! End-to-end SCD2 behaviour through the manager context.

use std::sync::Arc;

use serde_json::{json, Value};

use ingestkeeper::context::ManagerContext;
use ingestkeeper::secrets::KeyStore;
use ingestkeeper::storage::open_pool;
use ingestkeeper::storage::scd2::Record;

fn records(value: Value) -> Vec<Record> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect()
}

fn context(dir: &tempfile::TempDir) -> ManagerContext {
    let pool = open_pool(dir.path().join("scd2.db").to_str().unwrap()).unwrap();
    ManagerContext::new(pool, Arc::new(KeyStore::new()))
}

#[test]
fn test_region_rename_produces_two_versions() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir);
    let keys = ["region_cd"];

    let first = records(json!([
        {"region_cd": "1111000000", "locatadd_nm": "Seoul Jongno-gu"},
        {"region_cd": "1114000000", "locatadd_nm": "Seoul Jung-gu"}
    ]));
    assert_eq!(ctx.upsert_scd2("region_codes", &first, &keys).unwrap(), 2);

    // Same batch again: nothing changes.
    assert_eq!(ctx.upsert_scd2("region_codes", &first, &keys).unwrap(), 0);

    let renamed = records(json!([
        {"region_cd": "1111000000", "locatadd_nm": "Seoul Jongno"},
        {"region_cd": "1114000000", "locatadd_nm": "Seoul Jung-gu"}
    ]));
    assert_eq!(ctx.upsert_scd2("region_codes", &renamed, &keys).unwrap(), 1);

    let rows = ctx
        .execute_query(
            "SELECT locatadd_nm, is_current, valid_to FROM region_codes \
             WHERE region_cd = ?1 ORDER BY valid_from, id",
            &[json!("1111000000")],
        )
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["locatadd_nm"], "Seoul Jongno-gu");
    assert_eq!(rows[0]["is_current"], 0);
    assert!(rows[0]["valid_to"].is_string());
    assert_eq!(rows[1]["locatadd_nm"], "Seoul Jongno");
    assert_eq!(rows[1]["is_current"], 1);
    assert!(rows[1]["valid_to"].is_null());

    let current = ctx
        .execute_query("SELECT COUNT(*) AS n FROM region_codes WHERE is_current = 1", &[])
        .unwrap();
    assert_eq!(current[0]["n"], 2);
}

#[test]
fn test_upsert_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let batch = records(json!([{"tx_id": "TX1", "amount": "10.00", "currency": "KRW"}]));

    {
        let ctx = context(&dir);
        assert_eq!(ctx.upsert_scd2("transactions_scd", &batch, &["tx_id"]).unwrap(), 1);
    }

    // A fresh process starts with an empty column cache.
    let ctx = context(&dir);
    assert_eq!(ctx.upsert_scd2("transactions_scd", &batch, &["tx_id"]).unwrap(), 0);

    let with_extra = records(json!([{"tx_id": "TX1", "amount": "10.00", "currency": "KRW", "memo": "late"}]));
    assert_eq!(ctx.upsert_scd2("transactions_scd", &with_extra, &["tx_id"]).unwrap(), 1);
    assert_eq!(ctx.scd2().count_current("transactions_scd").unwrap(), 1);
}
