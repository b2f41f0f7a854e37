//! Statically built mapping from job name to implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::plan::{JobArgs, SchedulePlan};
use crate::context::ManagerContext;
use crate::error::{IngestError, Result};

/// A unit of scheduled work.
///
/// The orchestrator treats `run` as opaque: it may block on I/O, fail, or
/// panic, and is never retried inside a cycle. A `row_count` integer in the
/// returned object is copied to the completion record.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: &ManagerContext, args: &JobArgs) -> anyhow::Result<serde_json::Value>;
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under `name`, replacing any previous binding.
    pub fn register(&mut self, name: impl Into<String>, job: Arc<dyn Job>) -> &mut Self {
        self.jobs.insert(name.into(), job);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    /// Every enabled job of `plan` must have an implementation.
    pub fn validate(&self, plan: &SchedulePlan) -> Result<()> {
        match plan.enabled_names().find(|name| !self.contains(name)) {
            Some(missing) => Err(IngestError::UnregisteredJob(missing.to_string())),
            None => Ok(()),
        }
    }
}
