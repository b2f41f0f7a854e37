//! The orchestrator: polls for due jobs, orders them by `depends_on`, runs
//! them, and records every outcome in the history ledger.
//!
//! A poll cycle starts each due job as soon as its same-cycle dependencies
//! have succeeded, so a slow job only holds back its own dependents. If a
//! dependency fails (or is itself deferred) the job is deferred to a later
//! cycle with its `next_run` untouched. Errors and panics from a job are contained: they
//! become a `failed` record and never stop the loop or sibling jobs.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::clock::compute_next_run;
use super::history::{HistoryRecord, RunStatus};
use super::plan::{JobArgs, SchedulePlan, ScheduledJob};
use super::registry::JobRegistry;
use crate::context::ManagerContext;
use crate::error::{IngestError, Result};

/// How due jobs of one cycle are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Strictly one job at a time, in dependency order.
    Serial,
    /// Independent jobs run concurrently, at most `workers` at once.
    Concurrent { workers: usize },
}

/// What happened to each due job of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub deferred: Vec<String>,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty() && self.deferred.is_empty()
    }
}

/// Totals over every cycle of a [`Orchestrator::run_forever`] loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    pub cycles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deferred: u64,
}

impl LoopSummary {
    fn add(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.succeeded += report.succeeded.len() as u64;
        self.failed += report.failed.len() as u64;
        self.deferred += report.deferred.len() as u64;
    }
}

/// One line of a dry-run report.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    pub depends_on: Vec<String>,
    pub description: String,
    pub due_now: bool,
    pub next_run: DateTime<Utc>,
    pub following_run: DateTime<Utc>,
}

/// Validation summary produced without executing any job.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub evaluated_at: DateTime<Utc>,
    /// Jobs in dependency order.
    pub jobs: Vec<PlannedJob>,
}

/// Validate `plan` against `registry` and describe what would run at `now`.
pub fn dry_run(plan: &SchedulePlan, registry: &JobRegistry, now: DateTime<Utc>) -> Result<DryRunReport> {
    registry.validate(plan)?;
    let jobs = plan
        .jobs()
        .iter()
        .map(|job| planned(job, now))
        .collect::<Result<Vec<_>>>()?;
    Ok(DryRunReport {
        evaluated_at: now,
        jobs,
    })
}

fn planned(job: &ScheduledJob, now: DateTime<Utc>) -> Result<PlannedJob> {
    let following_run =
        compute_next_run(&job.spec, now).map_err(|reason| IngestError::schedule(&job.name, reason))?;
    Ok(PlannedJob {
        name: job.name.clone(),
        schedule: job.spec.to_string(),
        enabled: job.enabled,
        depends_on: job.depends_on.clone(),
        description: job.description.clone(),
        due_now: job.is_due(now),
        next_run: job.next_run,
        following_run,
    })
}

struct DueJob {
    name: String,
    args: JobArgs,
    depends_on: Vec<String>,
}

struct EngineState {
    /// Dependency order.
    jobs: Vec<ScheduledJob>,
    in_flight: HashSet<String>,
}

struct Shared {
    ctx: Arc<ManagerContext>,
    registry: JobRegistry,
    state: Mutex<EngineState>,
    permits: Arc<Semaphore>,
    mode: ExecutionMode,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, name: &str) {
        self.state().in_flight.remove(name);
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    schedule_path: Option<PathBuf>,
    schedule_mtime: Option<SystemTime>,
}

impl Orchestrator {
    /// Build an orchestrator. Fails if an enabled job is not registered.
    pub fn new(
        ctx: Arc<ManagerContext>,
        registry: JobRegistry,
        plan: SchedulePlan,
        mode: ExecutionMode,
    ) -> Result<Self> {
        registry.validate(&plan)?;
        let workers = match mode {
            ExecutionMode::Serial => 1,
            ExecutionMode::Concurrent { workers } => workers.max(1),
        };
        info!(jobs = plan.len(), ?mode, "orchestrator ready");
        Ok(Self {
            shared: Arc::new(Shared {
                ctx,
                registry,
                state: Mutex::new(EngineState {
                    jobs: plan.into_jobs(),
                    in_flight: HashSet::new(),
                }),
                permits: Arc::new(Semaphore::new(workers)),
                mode,
            }),
            schedule_path: None,
            schedule_mtime: None,
        })
    }

    /// Watch `path` for modifications while running forever.
    pub fn with_reload_from(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.schedule_mtime = modified(&path);
        self.schedule_path = Some(path);
        self
    }

    pub fn context(&self) -> &Arc<ManagerContext> {
        &self.shared.ctx
    }

    /// Current job table, in dependency order.
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        self.shared.state().jobs.clone()
    }

    /// Describe what is due at `now` without executing anything.
    pub fn dry_run(&self, now: DateTime<Utc>) -> Result<DryRunReport> {
        let jobs = self
            .jobs()
            .iter()
            .map(|job| planned(job, now))
            .collect::<Result<Vec<_>>>()?;
        Ok(DryRunReport {
            evaluated_at: now,
            jobs,
        })
    }

    /// Replace the schedule. Jobs whose recurrence rule is unchanged keep
    /// their `last_run` and `next_run`.
    pub fn reload(&self, plan: SchedulePlan) -> Result<()> {
        self.shared.registry.validate(&plan)?;
        let mut state = self.shared.state();
        let mut jobs = plan.into_jobs();
        for job in &mut jobs {
            if let Some(old) = state.jobs.iter().find(|o| o.name == job.name && o.spec == job.spec) {
                job.last_run = old.last_run;
                job.next_run = old.next_run;
            }
        }
        info!(jobs = jobs.len(), "schedule reloaded");
        state.jobs = jobs;
        Ok(())
    }

    /// Execute the jobs due now and return once they have all finished.
    pub async fn run_once(&self) -> CycleReport {
        self.run_once_at(Utc::now()).await
    }

    /// Execute the jobs due at `now` and return once they have all finished.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> CycleReport {
        let (due, deferred) = self.select_due(now);
        if due.is_empty() && deferred.is_empty() {
            info!(at = %now.to_rfc3339(), "no jobs due");
            return CycleReport::default();
        }
        execute_cycle(Arc::clone(&self.shared), due, deferred).await
    }

    /// Poll every `poll_interval` until `shutdown` becomes `true`. Jobs
    /// already running when the signal arrives are allowed to finish.
    pub async fn run_forever(&mut self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) -> LoopSummary {
        info!(poll_secs = poll_interval.as_secs_f64(), mode = ?self.shared.mode, "scheduler loop started");

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles: JoinSet<CycleReport> = JoinSet::new();
        let mut total = LoopSummary::default();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    while let Some(Some(done)) = cycles.join_next().now_or_never() {
                        collect(&mut total, done);
                    }
                    self.reload_if_changed();

                    let (due, deferred) = self.select_due(Utc::now());
                    if due.is_empty() && deferred.is_empty() {
                        continue;
                    }
                    let cycle = execute_cycle(Arc::clone(&self.shared), due, deferred);
                    match self.shared.mode {
                        ExecutionMode::Serial => total.add(&cycle.await),
                        ExecutionMode::Concurrent { .. } => {
                            cycles.spawn(cycle);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(in_flight = cycles.len(), "scheduler loop shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(done) = cycles.join_next().await {
            collect(&mut total, done);
        }
        info!(
            cycles = total.cycles,
            succeeded = total.succeeded,
            failed = total.failed,
            deferred = total.deferred,
            "scheduler loop stopped"
        );
        total
    }

    fn reload_if_changed(&mut self) {
        let Some(path) = self.schedule_path.clone() else {
            return;
        };
        let mtime = modified(&path);
        if mtime.is_none() || mtime == self.schedule_mtime {
            return;
        }
        self.schedule_mtime = mtime;

        let result = SchedulePlan::load(&path, Utc::now())
            .and_then(|plan| self.reload(plan).map_err(anyhow::Error::from));
        if let Err(e) = result {
            error!(path = %path.display(), error = %format!("{e:#}"), "schedule reload rejected, keeping current schedule");
        }
    }

    /// Pick the due jobs and mark them in flight. Jobs whose dependency is
    /// still running from an earlier cycle are returned as deferred.
    fn select_due(&self, now: DateTime<Utc>) -> (Vec<DueJob>, Vec<String>) {
        let mut state = self.shared.state();
        let mut due = Vec::new();
        let mut deferred = Vec::new();

        for job in state.jobs.iter().filter(|j| j.is_due(now)) {
            if state.in_flight.contains(&job.name) {
                continue;
            }
            if let Some(dep) = job.depends_on.iter().find(|d| state.in_flight.contains(*d)) {
                debug!(job = %job.name, dependency = %dep, "dependency still running, deferring");
                deferred.push(job.name.clone());
                continue;
            }
            due.push(DueJob {
                name: job.name.clone(),
                args: job.args.clone(),
                depends_on: job.depends_on.clone(),
            });
        }
        for job in &due {
            state.in_flight.insert(job.name.clone());
        }
        (due, deferred)
    }
}

fn collect(total: &mut LoopSummary, done: std::result::Result<CycleReport, tokio::task::JoinError>) {
    match done {
        Ok(report) => total.add(&report),
        Err(e) => error!("poll cycle task failed: {e}"),
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

enum Readiness {
    Ready,
    Waiting,
    Blocked(String),
}

/// Bookkeeping for one cycle's dependency gating.
struct CycleProgress {
    /// Every job due this cycle, including those deferred up front.
    in_cycle: HashSet<String>,
    blocked: HashSet<String>,
    succeeded: HashSet<String>,
    report: CycleReport,
}

impl CycleProgress {
    fn readiness(&self, job: &DueJob) -> Readiness {
        let mut deps = job.depends_on.iter().filter(|d| self.in_cycle.contains(*d));
        if let Some(dep) = deps.clone().find(|d| self.blocked.contains(*d)) {
            Readiness::Blocked(dep.clone())
        } else if deps.all(|d| self.succeeded.contains(d)) {
            Readiness::Ready
        } else {
            Readiness::Waiting
        }
    }

    fn finish(&mut self, name: String, ok: bool) {
        if ok {
            self.succeeded.insert(name.clone());
            self.report.succeeded.push(name);
        } else {
            self.blocked.insert(name.clone());
            self.report.failed.push(name);
        }
    }

    fn defer(&mut self, shared: &Shared, job: DueJob) {
        shared.release(&job.name);
        self.blocked.insert(job.name.clone());
        self.report.deferred.push(job.name);
    }

    /// Route a job that is not `Ready` to its outcome.
    fn hold(&mut self, shared: &Shared, job: DueJob, readiness: Readiness) {
        match readiness {
            Readiness::Blocked(dep) => {
                warn!(job = %job.name, dependency = %dep, "dependency did not succeed this cycle, deferring");
            }
            // Unreachable for an acyclic plan; never leave jobs in flight.
            _ => warn!(job = %job.name, "dependencies never became ready, deferring"),
        }
        self.defer(shared, job);
    }
}

/// Run one cycle's due jobs, each as soon as its dependencies allow.
async fn execute_cycle(shared: Arc<Shared>, due: Vec<DueJob>, pre_deferred: Vec<String>) -> CycleReport {
    let cycle_id = Uuid::new_v4();
    let span = info_span!("cycle", id = %cycle_id);

    async move {
        info!(due = due.len(), deferred = pre_deferred.len(), "poll cycle started");

        let mut progress = CycleProgress {
            in_cycle: due
                .iter()
                .map(|j| j.name.clone())
                .chain(pre_deferred.iter().cloned())
                .collect(),
            blocked: pre_deferred.iter().cloned().collect(),
            succeeded: HashSet::new(),
            report: CycleReport {
                deferred: pre_deferred,
                ..CycleReport::default()
            },
        };

        match shared.mode {
            ExecutionMode::Serial => run_serial(&shared, due, &mut progress).await,
            ExecutionMode::Concurrent { .. } => run_concurrent(&shared, due, &mut progress).await,
        }

        let report = progress.report;
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            "poll cycle finished"
        );
        report
    }
    .instrument(span)
    .await
}

/// `due` is in dependency order, so one pass settles every job.
async fn run_serial(shared: &Arc<Shared>, due: Vec<DueJob>, progress: &mut CycleProgress) {
    for job in due {
        match progress.readiness(&job) {
            Readiness::Ready => {
                let (name, ok) = run_job(Arc::clone(shared), job).await;
                progress.finish(name, ok);
            }
            other => progress.hold(shared, job, other),
        }
    }
}

/// Start every ready job, then re-examine the waiting ones each time any
/// running job finishes. Worker permits cap how many execute at once.
async fn run_concurrent(shared: &Arc<Shared>, due: Vec<DueJob>, progress: &mut CycleProgress) {
    let mut pending = due;
    let mut running = JoinSet::new();

    loop {
        let mut waiting = Vec::with_capacity(pending.len());
        for job in pending {
            match progress.readiness(&job) {
                Readiness::Ready => {
                    let shared = Arc::clone(shared);
                    running.spawn(async move {
                        let _permit = Arc::clone(&shared.permits).acquire_owned().await.ok();
                        run_job(shared, job).await
                    });
                }
                Readiness::Waiting => waiting.push(job),
                blocked => progress.hold(shared, job, blocked),
            }
        }
        pending = waiting;

        match running.join_next().await {
            Some(Ok((name, ok))) => progress.finish(name, ok),
            Some(Err(e)) => error!("job task failed to complete: {e}"),
            None => {
                for job in pending.drain(..) {
                    progress.hold(shared, job, Readiness::Waiting);
                }
                break;
            }
        }
    }
}

/// Run one job, record its outcome, and schedule its next run.
async fn run_job(shared: Arc<Shared>, job: DueJob) -> (String, bool) {
    let span = info_span!("job", job = %job.name);
    async move {
        let started_at = Utc::now();
        let ledger = shared.ctx.ledger();

        let start = HistoryRecord::new(&job.name, "job_start", RunStatus::Running)
            .with_started_at(started_at)
            .with_details(json!({ "args": job.args }));
        if let Err(e) = ledger.record(&start) {
            warn!(error = %e, "could not record job start");
        }
        info!("job started");

        let outcome = match shared.registry.get(&job.name) {
            Some(implementation) => AssertUnwindSafe(implementation.run(&shared.ctx, &job.args))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(anyhow::anyhow!("job panicked: {}", panic_message(&*panic)))),
            None => Err(anyhow::anyhow!("no implementation registered")),
        };
        let ended_at = Utc::now();

        let ok = match outcome {
            Ok(result) => {
                let row_count = result.get("row_count").and_then(|v| v.as_u64()).unwrap_or(0);
                let done = HistoryRecord::new(&job.name, "job_end", RunStatus::Success)
                    .with_started_at(started_at)
                    .with_ended_at(ended_at)
                    .with_row_count(row_count)
                    .with_details(result);
                if let Err(e) = ledger.record(&done) {
                    warn!(error = %e, "could not record job completion");
                }
                info!(row_count, duration_ms = done.duration_ms, "job succeeded");
                true
            }
            Err(e) => {
                let failure = IngestError::JobExecution {
                    job: job.name.clone(),
                    message: format!("{e:#}"),
                };
                let failed = HistoryRecord::new(&job.name, "job_error", RunStatus::Failed)
                    .with_started_at(started_at)
                    .with_ended_at(ended_at)
                    .with_details(json!({ "error": format!("{e:#}") }));
                if let Err(e) = ledger.record(&failed) {
                    warn!(error = %e, "could not record job failure");
                }
                error!(error = %failure, duration_ms = failed.duration_ms, "job failed");
                false
            }
        };

        complete(&shared, &job, started_at, ended_at);
        (job.name, ok)
    }
    .instrument(span)
    .await
}

/// Bookkeeping after any execution attempt, successful or not.
fn complete(shared: &Shared, job: &DueJob, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) {
    let mut state = shared.state();
    state.in_flight.remove(&job.name);
    let Some(entry) = state.jobs.iter_mut().find(|j| j.name == job.name) else {
        // Removed by a reload while running.
        return;
    };
    entry.last_run = Some(started_at);
    // A reload may have changed the rule mid-run; the current one wins.
    match compute_next_run(&entry.spec, ended_at) {
        Ok(next) => {
            debug!(next_run = %next.to_rfc3339(), "next run scheduled");
            entry.next_run = next;
        }
        Err(reason) => {
            error!(%reason, "schedule exhausted, disabling job");
            entry.enabled = false;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
