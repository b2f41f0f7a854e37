//! Schedule file loading and the `depends_on` graph.
//!
//! A [`SchedulePlan`] is the validated form of the schedule file: every
//! recurrence rule parsed, names unique, dependencies known and acyclic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::clock::{compute_next_run, RawSchedule, ScheduleSpec};
use crate::error::{IngestError, Result};

/// Free-form job arguments.
pub type JobArgs = serde_json::Map<String, serde_json::Value>;

/// On-disk shape of the schedule file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleFile {
    #[serde(default)]
    pub jobs: Vec<JobEntry>,
}

/// One entry of the schedule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub name: String,
    pub schedule: Option<RawSchedule>,
    #[serde(default)]
    pub args: JobArgs,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

/// A job definition plus its runtime bookkeeping.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub spec: ScheduleSpec,
    pub args: JobArgs,
    pub enabled: bool,
    pub depends_on: Vec<String>,
    pub description: String,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run <= now
    }
}

/// The validated schedule: jobs in topological order of `depends_on`.
#[derive(Debug, Clone)]
pub struct SchedulePlan {
    jobs: Vec<ScheduledJob>,
}

impl SchedulePlan {
    /// Read and validate a JSON schedule file. Every job starts due at
    /// `loaded_at`.
    pub fn load(path: &Path, loaded_at: DateTime<Utc>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schedule file: {}", path.display()))?;
        let file: ScheduleFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse schedule file: {}", path.display()))?;
        let plan = Self::from_file(file, loaded_at)?;
        info!(path = %path.display(), jobs = plan.len(), "loaded schedule");
        Ok(plan)
    }

    /// Validate an already decoded schedule file.
    pub fn from_file(file: ScheduleFile, loaded_at: DateTime<Utc>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(file.jobs.len());

        for entry in file.jobs {
            if !seen.insert(entry.name.clone()) {
                return Err(IngestError::DuplicateJob(entry.name));
            }
            let raw = entry
                .schedule
                .as_ref()
                .ok_or_else(|| IngestError::schedule(&entry.name, "missing 'schedule'"))?;
            let spec =
                ScheduleSpec::parse(raw).map_err(|reason| IngestError::schedule(&entry.name, reason))?;
            // Rules that can never fire are rejected here rather than at poll time.
            compute_next_run(&spec, loaded_at)
                .map_err(|reason| IngestError::schedule(&entry.name, reason))?;

            jobs.push(ScheduledJob {
                name: entry.name,
                spec,
                args: entry.args,
                enabled: entry.enabled,
                depends_on: entry.depends_on,
                description: entry.description,
                last_run: None,
                next_run: loaded_at,
            });
        }

        let order = topological_order(&jobs)?;
        let mut by_name: HashMap<String, ScheduledJob> =
            jobs.into_iter().map(|j| (j.name.clone(), j)).collect();
        let jobs = order
            .into_iter()
            .filter_map(|name| by_name.remove(&name))
            .collect();

        Ok(Self { jobs })
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub fn into_jobs(self) -> Vec<ScheduledJob> {
        self.jobs
    }

    pub fn get(&self, name: &str) -> Option<&ScheduledJob> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Enabled job names, in dependency order.
    pub fn enabled_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().filter(|j| j.enabled).map(|j| j.name.as_str())
    }
}

/// Kahn's algorithm over `depends_on`. Ties keep file order so the result is
/// stable across loads.
fn topological_order(jobs: &[ScheduledJob]) -> Result<Vec<String>> {
    let index: HashMap<&str, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; jobs.len()];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); jobs.len()];

    for (i, job) in jobs.iter().enumerate() {
        for dep in &job.depends_on {
            let &d = index.get(dep.as_str()).ok_or_else(|| IngestError::UnknownDependency {
                job: job.name.clone(),
                dependency: dep.clone(),
            })?;
            if d == i {
                return Err(IngestError::CyclicDependency(job.name.clone()));
            }
            in_degree[i] += 1;
            downstream[d].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..jobs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(jobs.len());

    while let Some(i) = queue.pop_front() {
        order.push(jobs[i].name.clone());
        for &next in &downstream[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != jobs.len() {
        let stuck = (0..jobs.len())
            .find(|&i| in_degree[i] > 0)
            .map(|i| jobs[i].name.clone())
            .unwrap_or_default();
        return Err(IngestError::CyclicDependency(stuck));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(json: &str) -> Result<SchedulePlan> {
        let file: ScheduleFile = serde_json::from_str(json).unwrap();
        SchedulePlan::from_file(file, Utc::now())
    }

    #[test]
    fn test_dependencies_come_first() {
        let p = plan(
            r#"{"jobs":[
                {"name":"report","schedule":{"type":"daily","time":"06:00"},"depends_on":["load"]},
                {"name":"load","schedule":{"type":"interval","seconds":60},"depends_on":["fetch"]},
                {"name":"fetch","schedule":{"type":"interval","seconds":60}}
            ]}"#,
        )
        .unwrap();
        let names: Vec<&str> = p.jobs().iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, ["fetch", "load", "report"]);
    }

    #[test]
    fn test_defaults_applied() {
        let p = plan(r#"{"jobs":[{"name":"a","schedule":{"type":"interval","seconds":5}}]}"#).unwrap();
        let job = p.get("a").unwrap();
        assert!(job.enabled);
        assert!(job.args.is_empty());
        assert!(job.depends_on.is_empty());
        assert!(job.last_run.is_none());
    }

    #[test]
    fn test_cycle_rejected() {
        let err = plan(
            r#"{"jobs":[
                {"name":"a","schedule":{"type":"interval","seconds":5},"depends_on":["c"]},
                {"name":"b","schedule":{"type":"interval","seconds":5},"depends_on":["a"]},
                {"name":"c","schedule":{"type":"interval","seconds":5},"depends_on":["b"]}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::CyclicDependency(_)));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = plan(
            r#"{"jobs":[{"name":"a","schedule":{"type":"interval","seconds":5},"depends_on":["a"]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::CyclicDependency(ref n) if n == "a"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = plan(
            r#"{"jobs":[{"name":"a","schedule":{"type":"interval","seconds":5},"depends_on":["ghost"]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::UnknownDependency { .. }));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = plan(
            r#"{"jobs":[
                {"name":"a","schedule":{"type":"interval","seconds":5}},
                {"name":"a","schedule":{"type":"interval","seconds":9}}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::DuplicateJob(_)));
    }

    #[test]
    fn test_invalid_schedule_fails_at_load() {
        for json in [
            r#"{"jobs":[{"name":"a"}]}"#,
            r#"{"jobs":[{"name":"a","schedule":{"type":"cron","expression":"0 2 * *"}}]}"#,
            r#"{"jobs":[{"name":"a","schedule":{"type":"cron","expression":"0 0 31 2 *"}}]}"#,
            r#"{"jobs":[{"name":"a","schedule":{"type":"weekly","weekday":"someday","time":"01:00"}}]}"#,
            r#"{"jobs":[{"name":"a","schedule":{"type":"interval","seconds":18446744073709551615}}]}"#,
            r#"{"jobs":[{"name":"a","schedule":{"type":"interval","seconds":9223372036854775}}]}"#,
        ] {
            let err = plan(json).unwrap_err();
            assert!(matches!(err, IngestError::ScheduleParse { .. }), "{}", json);
        }
    }

    #[test]
    fn test_disabled_jobs_kept_but_not_due() {
        let now = Utc::now();
        let file: ScheduleFile = serde_json::from_str(
            r#"{"jobs":[{"name":"a","schedule":{"type":"interval","seconds":5},"enabled":false}]}"#,
        )
        .unwrap();
        let p = SchedulePlan::from_file(file, now).unwrap();
        assert!(!p.get("a").unwrap().is_due(now));
        assert_eq!(p.enabled_names().count(), 0);
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.json");
        std::fs::write(
            &path,
            r#"{"jobs":[{"name":"a","schedule":{"type":"daily","time":"02:00"},"args":{"limit":3}}]}"#,
        )
        .unwrap();
        let p = SchedulePlan::load(&path, Utc::now()).unwrap();
        assert_eq!(p.get("a").unwrap().args["limit"], 3);
    }
}
