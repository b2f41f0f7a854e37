use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::clients::SourceClient;
use crate::context::ManagerContext;
use crate::scheduler::{Job, JobArgs, RunStatus};

/// Where a [`FetchRecords`] job reads from and writes to when its schedule
/// entry does not say otherwise.
#[derive(Debug, Clone, Default)]
pub struct FetchDefaults {
    pub method: String,
    pub table: String,
    pub key_fields: Vec<String>,
    /// Empty means "every non-key field of the batch".
    pub attribute_fields: Vec<String>,
    /// Named key resolved through the context and passed as `service_key`.
    pub api_key: Option<String>,
}

/// Pull a batch from a source client and historize it into an SCD2 table.
///
/// Recognised args: `method`, `table`, `key_fields`, `attribute_fields`,
/// `api_key`, `params` (object forwarded to the client) and `limit`.
pub struct FetchRecords {
    name: String,
    client: Arc<dyn SourceClient>,
    defaults: FetchDefaults,
}

impl FetchRecords {
    /// `name` is the job name written to the history rows this job emits.
    pub fn new(name: impl Into<String>, client: Arc<dyn SourceClient>, defaults: FetchDefaults) -> Self {
        Self {
            name: name.into(),
            client,
            defaults,
        }
    }
}

fn string_arg(args: &JobArgs, name: &str, default: &str) -> Result<String> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => bail!("arg {name:?} must be a string, got {other}"),
    }
}

fn list_arg(args: &JobArgs, name: &str, default: &[String]) -> Result<Vec<String>> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(default.to_vec()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("arg {name:?} must be a list of strings"))
            })
            .collect(),
        Some(other) => bail!("arg {name:?} must be a list of strings, got {other}"),
    }
}

#[async_trait::async_trait]
impl Job for FetchRecords {
    async fn run(&self, ctx: &ManagerContext, args: &JobArgs) -> Result<Value> {
        let method = string_arg(args, "method", &self.defaults.method)?;
        let table = string_arg(args, "table", &self.defaults.table)?;
        let key_fields = list_arg(args, "key_fields", &self.defaults.key_fields)?;
        let attribute_fields = list_arg(args, "attribute_fields", &self.defaults.attribute_fields)?;
        if method.is_empty() || table.is_empty() || key_fields.is_empty() {
            bail!("method, table and key_fields are required");
        }

        let mut params = match args.get("params") {
            Some(Value::Object(map)) => map.clone(),
            None | Some(Value::Null) => JobArgs::new(),
            Some(other) => bail!("arg \"params\" must be an object, got {other}"),
        };
        if let Some(limit) = args.get("limit") {
            params.entry("limit").or_insert_with(|| limit.clone());
        }
        let api_key = match args.get("api_key").and_then(Value::as_str) {
            Some(name) => Some(name.to_string()),
            None => self.defaults.api_key.clone(),
        };
        if let Some(name) = api_key {
            let key = ctx.get_api_key(&name)?;
            params.insert("service_key".into(), Value::String(key));
        }

        let records = match self.client.fetch(&method, &params).await {
            Ok(records) => records,
            Err(e) => {
                error!(source = self.client.name(), %method, error = %format!("{e:#}"), "source request failed");
                ctx.log_history(
                    &self.name,
                    "api_error",
                    RunStatus::Failed,
                    0,
                    Some(json!({ "source": self.client.name(), "method": method, "error": format!("{e:#}") })),
                )?;
                return Err(e.context(format!("fetching {method} from {}", self.client.name())));
            }
        };
        info!(count = records.len(), %method, "fetched records");
        ctx.log_history(
            &self.name,
            "data_load",
            RunStatus::Success,
            records.len() as u64,
            Some(json!({ "source": self.client.name(), "method": method })),
        )?;

        let inserted = if attribute_fields.is_empty() {
            ctx.upsert_scd2(&table, &records, &key_fields)
        } else {
            ctx.upsert_scd2_with_attributes(&table, &records, &key_fields, &attribute_fields)
        }
        .with_context(|| format!("SCD2 upsert into {table}"))?;

        ctx.log_history(
            &self.name,
            "scd2_upsert",
            RunStatus::Success,
            inserted as u64,
            Some(json!({ "table": table })),
        )?;
        info!(inserted, %table, "records historized");

        Ok(json!({
            "row_count": inserted,
            "table": table,
            "total_fetched": records.len(),
        }))
    }
}
