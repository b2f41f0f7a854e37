use anyhow::{bail, Result};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};

use super::SourceClient;
use crate::scheduler::JobArgs;
use crate::storage::format_ts;
use crate::storage::scd2::Record;

const CURRENCIES: [&str; 3] = ["KRW", "USD", "EUR"];
const DEFAULT_LIMIT: u64 = 5;

/// Code, full name, order, parent code, short name.
const REGIONS: [(&str, &str, u32, &str, &str); 5] = [
    ("1100000000", "Seoul", 1, "0000000000", "Seoul"),
    ("1111000000", "Seoul Jongno-gu", 2, "1100000000", "Jongno-gu"),
    ("1111010100", "Seoul Jongno-gu Cheongun-dong", 3, "1111000000", "Cheongun-dong"),
    ("1114000000", "Seoul Jung-gu", 2, "1100000000", "Jung-gu"),
    ("2600000000", "Busan", 1, "0000000000", "Busan"),
];

/// Generates random transactions for development and tests.
#[derive(Debug, Default, Clone)]
pub struct MockClient;

impl MockClient {
    pub fn new() -> Self {
        Self
    }

    /// `limit` records with `tx_id`, `amount`, `currency` and `updated_at`.
    pub fn transactions(&self, limit: u64) -> Vec<Record> {
        let mut rng = rand::thread_rng();
        let now = format_ts(Utc::now());
        (0..limit)
            .map(|_| {
                let id: String = (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(8)
                    .map(|c| (c as char).to_ascii_uppercase())
                    .collect();
                let amount = (rng.gen_range(100.0..10_000.0_f64) * 100.0).round() / 100.0;
                let currency = CURRENCIES.choose(&mut rng).copied().unwrap_or("KRW");
                let record = json!({
                    "tx_id": format!("TX{id}"),
                    "amount": format!("{amount:.2}"),
                    "currency": currency,
                    "updated_at": now,
                });
                match record {
                    Value::Object(map) => map,
                    _ => Record::new(),
                }
            })
            .collect()
    }

    /// A fixed table of legal district codes. Code segments (`sido_cd`,
    /// `sgg_cd`, `umd_cd`, `ri_cd`) are sliced from the 10-digit `region_cd`.
    pub fn region_codes(&self, limit: u64) -> Vec<Record> {
        REGIONS
            .iter()
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|(code, name, order, high, low)| {
                let record = json!({
                    "region_cd": code,
                    "sido_cd": &code[..2],
                    "sgg_cd": &code[2..5],
                    "umd_cd": &code[5..8],
                    "ri_cd": &code[8..],
                    "locatjumin_cd": code,
                    "locatjijuk_cd": code,
                    "locatadd_nm": name,
                    "locat_order": order.to_string(),
                    "locat_rm": null,
                    "locathigh_cd": high,
                    "locallow_nm": low,
                    "adpt_de": "20240101",
                });
                match record {
                    Value::Object(map) => map,
                    _ => Record::new(),
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl SourceClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(&self, method: &str, params: &JobArgs) -> Result<Vec<Record>> {
        match method {
            "fetch_transactions" | "fetch_DB_transactions" => {
                let limit = params
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_LIMIT);
                Ok(self.transactions(limit))
            }
            "region_codes" => {
                let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(u64::MAX);
                Ok(self.region_codes(limit))
            }
            other => bail!("mock client has no method {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_honours_limit() {
        let client = MockClient::new();
        let mut params = JobArgs::new();
        params.insert("limit".into(), json!(3));

        let records = client.fetch("fetch_transactions", &params).await.unwrap();
        assert_eq!(records.len(), 3);
        for r in &records {
            let id = r["tx_id"].as_str().unwrap();
            assert!(id.starts_with("TX") && id.len() == 10);
            assert!(CURRENCIES.contains(&r["currency"].as_str().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_region_codes_are_stable() {
        let client = MockClient::new();
        let first = client.fetch("region_codes", &JobArgs::new()).await.unwrap();
        let second = client.fetch("region_codes", &JobArgs::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), REGIONS.len());

        let dong = &first[2];
        assert_eq!(dong["region_cd"], "1111010100");
        assert_eq!(dong["sido_cd"], "11");
        assert_eq!(dong["sgg_cd"], "110");
        assert_eq!(dong["umd_cd"], "101");
        assert_eq!(dong["ri_cd"], "00");
        assert_eq!(dong["locathigh_cd"], "1111000000");
    }

    #[tokio::test]
    async fn test_unknown_method_fails() {
        let client = MockClient::new();
        assert!(client.fetch("nope", &JobArgs::new()).await.is_err());
    }
}
