//! Built-in job implementations and the default registry.

use std::sync::Arc;

use crate::clients::SourceClient;
use crate::scheduler::JobRegistry;

pub mod fetch_records;

pub use fetch_records::{FetchDefaults, FetchRecords};

/// Attributes tracked for legal district codes.
const REGION_ATTRIBUTES: &[&str] = &[
    "sido_cd",
    "sgg_cd",
    "umd_cd",
    "ri_cd",
    "locatjumin_cd",
    "locatjijuk_cd",
    "locatadd_nm",
    "locat_order",
    "locat_rm",
    "locathigh_cd",
    "locallow_nm",
    "adpt_de",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Registry of the jobs shipped with the binary, all bound to `client`.
///
/// * `fetch_transactions`: transactions into `transactions_scd` keyed by `tx_id`.
/// * `update_region_codes`: legal district codes into `region_codes` keyed by
///   `region_cd`; needs the `opendata_service_key` secret.
/// * `fetch_records`: generic; `method`, `table` and `key_fields` come from args.
pub fn default_registry(client: Arc<dyn SourceClient>) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry
        .register(
            "fetch_transactions",
            Arc::new(FetchRecords::new(
                "fetch_transactions",
                Arc::clone(&client),
                FetchDefaults {
                    method: "fetch_transactions".into(),
                    table: "transactions_scd".into(),
                    key_fields: strings(&["tx_id"]),
                    attribute_fields: strings(&["amount", "currency", "updated_at"]),
                    api_key: None,
                },
            )),
        )
        .register(
            "update_region_codes",
            Arc::new(FetchRecords::new(
                "update_region_codes",
                Arc::clone(&client),
                FetchDefaults {
                    method: "region_codes".into(),
                    table: "region_codes".into(),
                    key_fields: strings(&["region_cd"]),
                    attribute_fields: strings(REGION_ATTRIBUTES),
                    api_key: Some("opendata_service_key".into()),
                },
            )),
        )
        .register(
            "fetch_records",
            Arc::new(FetchRecords::new("fetch_records", client, FetchDefaults::default())),
        );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockClient;
    use crate::context::ManagerContext;
    use crate::scheduler::{Job, JobArgs};
    use crate::secrets::KeyStore;
    use crate::storage::open_pool;

    #[tokio::test]
    async fn test_region_codes_job_runs_against_mock() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("regions.db").to_str().unwrap()).unwrap();
        let mut keys = KeyStore::new();
        keys.insert("opendata_service_key", "test-key");
        let ctx = ManagerContext::new(pool, Arc::new(keys));

        let registry = default_registry(Arc::new(MockClient::new()));
        let job = registry.get("update_region_codes").unwrap();
        let result = job.run(&ctx, &JobArgs::new()).await.unwrap();
        assert_eq!(result["row_count"], 5);

        // Unchanged upstream data produces no new versions.
        let again = job.run(&ctx, &JobArgs::new()).await.unwrap();
        assert_eq!(again["row_count"], 0);
        assert_eq!(ctx.scd2().count_current("region_codes").unwrap(), 5);
    }

    #[test]
    fn test_default_registry_names() {
        let registry = default_registry(Arc::new(MockClient::new()));
        let mut names: Vec<&str> = registry.names().collect();
        names.sort();
        assert_eq!(names, vec!["fetch_records", "fetch_transactions", "update_region_codes"]);
    }
}
