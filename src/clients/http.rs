use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use zeroize::Zeroizing;

use super::SourceClient;
use crate::scheduler::JobArgs;
use crate::storage::scd2::Record;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches records from a JSON HTTP endpoint.
///
/// `fetch("trades", {"page": 2})` issues `GET <base_url>/trades?page=2` and
/// expects a JSON array of objects in the response body. Nested values are
/// kept as JSON and stored as text by the SCD2 layer.
pub struct HttpJsonClient {
    client: Client,
    base_url: String,
    api_key: Option<Zeroizing<String>>,
}

impl HttpJsonClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.map(Zeroizing::new),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method.trim_start_matches('/'))
    }
}

fn query_pairs(params: &JobArgs) -> Vec<(String, String)> {
    params
        .iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(s) => Some((k.clone(), s.clone())),
            other => Some((k.clone(), other.to_string())),
        })
        .collect()
}

fn into_records(body: Value) -> Result<Vec<Record>> {
    let Value::Array(items) = body else {
        bail!("expected a JSON array of records");
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => bail!("record {i} is not an object: {other}"),
        })
        .collect()
}

#[async_trait::async_trait]
impl SourceClient for HttpJsonClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, method: &str, params: &JobArgs) -> Result<Vec<Record>> {
        let url = self.url(method);
        let mut request = self.client.get(&url).query(&query_pairs(params));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.as_str());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("{url} returned {status}");
        }
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("{url} returned invalid JSON"))?;
        let records = into_records(body).with_context(|| format!("unexpected payload from {url}"))?;
        debug!(%url, count = records.len(), "fetched records");
        Ok(records)
    }
}
