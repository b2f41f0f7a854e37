//! Scheduling: recurrence rules, the schedule plan, the job registry, the
//! history ledger, and the orchestrator that ties them together.

pub mod clock;
pub mod cron;
pub mod engine;
pub mod history;
pub mod plan;
pub mod registry;

pub use self::clock::{compute_next_run, ScheduleSpec};
pub use self::cron::CronExpr;
pub use self::engine::{dry_run, CycleReport, DryRunReport, ExecutionMode, LoopSummary, Orchestrator};
pub use self::history::{HistoryLedger, HistoryRecord, RunStatus};
pub use self::plan::{JobArgs, SchedulePlan, ScheduledJob};
pub use self::registry::{Job, JobRegistry};
