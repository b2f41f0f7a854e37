//! Upstream data sources.
//!
//! A source client is chosen once at startup from configuration and handed to
//! the built-in jobs. There is no runtime fallback between clients.

use anyhow::Result;

use crate::scheduler::JobArgs;
use crate::storage::scd2::Record;

pub mod http;
pub mod mock;

pub use http::HttpJsonClient;
pub use mock::MockClient;

/// Trait for all record sources
#[async_trait::async_trait]
pub trait SourceClient: Send + Sync {
    /// Short name used in history details.
    fn name(&self) -> &str;

    /// Call `method` with `params` and return flat JSON records.
    async fn fetch(&self, method: &str, params: &JobArgs) -> Result<Vec<Record>>;
}
