use crate::error::truncate_message;
use crate::plan::{Plan, PlanTask};
use crate::types::{Host, Phase, TaskRunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// TaskRun
// ---------------------------------------------------------------------------

/// One terminal event in a run's append-only task log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_run_id: String,
    pub run_id: String,
    pub project_id: String,
    pub phase: Phase,
    pub task_id: String,
    pub status: TaskRunStatus,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Position of the task in the plan.
    pub order_index: u32,
    /// 1-based position in the log, assigned by the store on append.
    #[serde(default)]
    pub seq: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TaskRun {
    fn new(
        run_id: &str,
        project_id: &str,
        task: &PlanTask,
        status: TaskRunStatus,
        output: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_run_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            project_id: project_id.to_string(),
            phase: task.phase,
            task_id: task.task_id.clone(),
            status,
            agent: task.agent.clone(),
            host: None,
            output,
            error: None,
            order_index: task.order_index,
            seq: 0,
            started_at: now,
            ended_at: now,
        }
    }

    pub fn completed(
        run_id: &str,
        project_id: &str,
        task: &PlanTask,
        output: serde_json::Value,
    ) -> Self {
        Self::new(run_id, project_id, task, TaskRunStatus::Completed, output)
    }

    /// The skip reason is kept as the output payload.
    pub fn skipped(run_id: &str, project_id: &str, task: &PlanTask, reason: &str) -> Self {
        Self::new(
            run_id,
            project_id,
            task,
            TaskRunStatus::Skipped,
            serde_json::json!({ "reason": reason }),
        )
    }

    pub fn failed(run_id: &str, project_id: &str, task: &PlanTask, error: &str) -> Self {
        let mut run = Self::new(
            run_id,
            project_id,
            task,
            TaskRunStatus::Failed,
            serde_json::Value::Null,
        );
        run.error = Some(truncate_message(error));
        run
    }

    pub fn on_host(mut self, host: Host) -> Self {
        self.host = Some(host);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }
}

// ---------------------------------------------------------------------------
// Log derivations
// ---------------------------------------------------------------------------

/// Task ids with at least one completed or skipped entry.
pub fn done_set(log: &[TaskRun]) -> BTreeSet<&str> {
    log.iter()
        .filter(|r| r.status.is_done())
        .map(|r| r.task_id.as_str())
        .collect()
}

/// Most recent entry for `task_id`, in log order.
pub fn latest_status(log: &[TaskRun], task_id: &str) -> Option<TaskRunStatus> {
    log.iter()
        .rev()
        .find(|r| r.task_id == task_id)
        .map(|r| r.status)
}

/// Effective status per task: any done entry wins over a failure, and among
/// done entries the latest one decides completed versus skipped.
pub fn task_states(log: &[TaskRun]) -> BTreeMap<&str, TaskRunStatus> {
    let mut states: BTreeMap<&str, TaskRunStatus> = BTreeMap::new();
    for run in log {
        let entry = states.entry(run.task_id.as_str()).or_insert(run.status);
        if run.status.is_done() || !entry.is_done() {
            *entry = run.status;
        }
    }
    states
}

/// Run-level aggregates, always recomputed from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub planned: usize,
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Phase of the first task that is not done; `None` once all are.
    pub current_phase: Option<Phase>,
}

impl RunCounters {
    pub fn done(&self) -> usize {
        self.executed + self.skipped
    }

    pub fn is_complete(&self) -> bool {
        self.done() >= self.planned
    }
}

pub fn summarize(plan: &Plan, log: &[TaskRun]) -> RunCounters {
    let states = task_states(log);
    let mut counters = RunCounters {
        planned: plan.total_tasks(),
        ..RunCounters::default()
    };
    for task in plan.tasks() {
        match states.get(task.task_id.as_str()) {
            Some(TaskRunStatus::Completed) => counters.executed += 1,
            Some(TaskRunStatus::Skipped) => counters.skipped += 1,
            Some(TaskRunStatus::Failed) => {
                counters.failed += 1;
                counters.current_phase.get_or_insert(task.phase);
            }
            None => {
                counters.current_phase.get_or_insert(task.phase);
            }
        }
    }
    counters
}

/// True when every task of `phase` has a done entry. An empty phase never is.
pub fn phase_done(plan: &Plan, phase: Phase, done: &BTreeSet<&str>) -> bool {
    let tasks = plan.phase_tasks(phase);
    !tasks.is_empty() && tasks.iter().all(|t| done.contains(t.task_id.as_str()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
