//! Task state machine over the append-only task-run log.
//!
//! Nothing here keeps a cursor. Every answer is derived from the latest plan
//! and the log of the run executing it, so a restart resumes by re-scanning.

use crate::error::{AutopilotError, Result};
use crate::gate::{self, GateApproval};
use crate::plan::{Plan, PlanTask};
use crate::store::{PlanRecord, RunRecord, Store};
use crate::task::{self, RunCounters, TaskRun};
use crate::types::{Phase, RunStatus, TaskRunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
}

impl From<&RunCounters> for Progress {
    fn from(c: &RunCounters) -> Self {
        Self {
            completed: c.done(),
            total: c.planned,
            current_phase: c.current_phase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextTask {
    Ready {
        task: Box<PlanTask>,
        progress: Progress,
    },
    Blocked {
        gate_id: String,
        criteria: Vec<String>,
        phase: Phase,
        progress: Progress,
    },
    AllComplete {
        progress: Progress,
    },
    NoPlan,
}

impl NextTask {
    pub fn task(&self) -> Option<&PlanTask> {
        match self {
            NextTask::Ready { task, .. } => Some(task.as_ref()),
            _ => None,
        }
    }

    pub fn is_all_complete(&self) -> bool {
        matches!(self, NextTask::AllComplete { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskRunStatus,
    pub run_status: RunStatus,
    pub next: NextTask,
}

// ---------------------------------------------------------------------------
// Checklist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    Skipped,
    Failed,
    Current,
    Pending,
    Blocked,
}

impl ItemStatus {
    pub fn marker(self) -> &'static str {
        match self {
            ItemStatus::Completed => "[x]",
            ItemStatus::Skipped => "[~]",
            ItemStatus::Failed => "[!]",
            ItemStatus::Current => "[>]",
            ItemStatus::Pending => "[ ]",
            ItemStatus::Blocked => "[#]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub task_id: String,
    pub title: String,
    pub status: ItemStatus,
    pub marker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistPhase {
    pub phase: Phase,
    pub tasks: Vec<ChecklistItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checklist {
    pub phases: Vec<ChecklistPhase>,
    pub completed: usize,
    pub total: usize,
    pub text: String,
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

/// Latest plan plus the run executing it, if any.
struct RunContext {
    plan: PlanRecord,
    run: Option<RunRecord>,
    log: Vec<TaskRun>,
}

pub struct TaskStateMachine<'a> {
    store: &'a dyn Store,
}

impl<'a> TaskStateMachine<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    fn context(&self, project_id: &str) -> Result<Option<RunContext>> {
        let Some(plan) = self.store.latest_plan(project_id)? else {
            return Ok(None);
        };
        let run = self
            .store
            .latest_run(project_id)?
            .filter(|r| r.plan_id == plan.plan_id);
        let log = match &run {
            Some(r) => self.store.list_task_runs(&r.run_id)?,
            None => Vec::new(),
        };
        Ok(Some(RunContext { plan, run, log }))
    }

    /// The run currently executing the latest plan; it must accept new entries.
    fn open_run(&self, project_id: &str, to: &str) -> Result<(PlanRecord, RunRecord)> {
        let ctx = self
            .context(project_id)?
            .ok_or_else(|| AutopilotError::PlanNotFound(project_id.to_string()))?;
        let run = ctx
            .run
            .ok_or_else(|| AutopilotError::RunNotFound(project_id.to_string()))?;
        if matches!(run.status, RunStatus::Completed | RunStatus::Terminated) {
            return Err(AutopilotError::InvalidTransition {
                from: run.status.to_string(),
                to: to.to_string(),
                reason: format!("run {} no longer accepts task updates", run.run_id),
            });
        }
        Ok((ctx.plan, run))
    }

    /// Start a fresh run of the latest plan. Any run still in flight is
    /// terminated first so a project has one open run at a time.
    pub fn start_run(&self, project_id: &str) -> Result<RunRecord> {
        let plan = self
            .store
            .latest_plan(project_id)?
            .ok_or_else(|| AutopilotError::PlanNotFound(project_id.to_string()))?;
        if let Some(mut previous) = self.store.latest_run(project_id)? {
            if !previous.status.is_terminal() {
                previous.finish(RunStatus::Terminated);
                self.store.update_run(&previous)?;
            }
        }
        let run = RunRecord::new(project_id, &plan.plan);
        self.store.create_run(&run)?;
        tracing::info!(
            project_id,
            run_id = %run.run_id,
            plan_id = %plan.plan_id,
            planned = run.planned,
            "run started"
        );
        Ok(run)
    }

    /// Resume the open run of the latest plan, or start one.
    pub fn ensure_run(&self, project_id: &str) -> Result<RunRecord> {
        match self.context(project_id)? {
            Some(RunContext {
                run: Some(run), ..
            }) if !matches!(run.status, RunStatus::Completed | RunStatus::Terminated) => Ok(run),
            _ => self.start_run(project_id),
        }
    }

    pub fn next_task(&self, project_id: &str) -> Result<NextTask> {
        match self.context(project_id)? {
            Some(ctx) => self.next_in_plan(project_id, &ctx.plan.plan, &ctx.log),
            None => Ok(NextTask::NoPlan),
        }
    }

    /// First task of `plan` without a done entry in `log`, unless its phase
    /// sits behind an unapproved gate.
    pub fn next_in_plan(&self, project_id: &str, plan: &Plan, log: &[TaskRun]) -> Result<NextTask> {
        let done = task::done_set(log);
        let progress = Progress::from(&task::summarize(plan, log));
        for task in plan.tasks() {
            if done.contains(task.task_id.as_str()) {
                continue;
            }
            if let Some(gate) = self.blocking_gate(project_id, plan, task.phase)? {
                return Ok(NextTask::Blocked {
                    gate_id: gate.gate_id.clone(),
                    criteria: gate.criteria.clone(),
                    phase: task.phase,
                    progress,
                });
            }
            return Ok(NextTask::Ready {
                task: Box::new(task.clone()),
                progress,
            });
        }
        Ok(NextTask::AllComplete { progress })
    }

    fn blocking_gate<'p>(
        &self,
        project_id: &str,
        plan: &'p Plan,
        phase: Phase,
    ) -> Result<Option<&'p gate::GateDefinition>> {
        let Some(gate) = gate::gate_for_phase(phase).and_then(|id| plan.gate(id)) else {
            return Ok(None);
        };
        if self.store.is_gate_approved(project_id, &gate.gate_id)? {
            Ok(None)
        } else {
            Ok(Some(gate))
        }
    }

    pub fn complete_task(
        &self,
        project_id: &str,
        task_id: &str,
        summary: &str,
        artifacts: &[String],
        evidence: serde_json::Value,
    ) -> Result<TaskOutcome> {
        let (plan, run) = self.open_run(project_id, "completed")?;
        let task = plan
            .plan
            .task(task_id)
            .ok_or_else(|| AutopilotError::TaskNotFound(task_id.to_string()))?;
        let output = serde_json::json!({
            "summary": summary,
            "artifacts": artifacts,
            "evidence": evidence,
        });
        let entry = TaskRun::completed(&run.run_id, project_id, task, output);
        self.apply(project_id, &plan.plan, run, entry)
    }

    pub fn skip_task(&self, project_id: &str, task_id: &str, reason: &str) -> Result<TaskOutcome> {
        let (plan, run) = self.open_run(project_id, "skipped")?;
        let task = plan
            .plan
            .task(task_id)
            .ok_or_else(|| AutopilotError::TaskNotFound(task_id.to_string()))?;
        let entry = TaskRun::skipped(&run.run_id, project_id, task, reason);
        self.apply(project_id, &plan.plan, run, entry)
    }

    /// Record a failure. The task stays pending and is handed out again.
    pub fn fail_task(&self, project_id: &str, task_id: &str, error: &str) -> Result<TaskOutcome> {
        let (plan, run) = self.open_run(project_id, "failed")?;
        let task = plan
            .plan
            .task(task_id)
            .ok_or_else(|| AutopilotError::TaskNotFound(task_id.to_string()))?;
        let entry = TaskRun::failed(&run.run_id, project_id, task, error);
        self.apply(project_id, &plan.plan, run, entry)
    }

    fn apply(
        &self,
        project_id: &str,
        plan: &Plan,
        mut run: RunRecord,
        entry: TaskRun,
    ) -> Result<TaskOutcome> {
        let task_id = entry.task_id.clone();
        let status = entry.status;
        self.store.append_task_run(&entry)?;
        tracing::debug!(project_id, task_id = %task_id, %status, "task recorded");

        let log = self.store.list_task_runs(&run.run_id)?;
        self.approve_finished_phases(project_id, plan, &log)?;
        let next = self.next_in_plan(project_id, plan, &log)?;
        self.sync_run(&mut run, plan, &log, &next)?;

        Ok(TaskOutcome {
            task_id,
            status,
            run_status: run.status,
            next,
        })
    }

    /// Approve, as the system actor, every gate whose source phase is done.
    /// Returns the gates approved by this call.
    pub fn approve_finished_phases(
        &self,
        project_id: &str,
        plan: &Plan,
        log: &[TaskRun],
    ) -> Result<Vec<String>> {
        let done = task::done_set(log);
        let mut approved = Vec::new();
        for gate in &plan.gates {
            let Some(phase) = gate::source_phase(&gate.gate_id) else {
                continue;
            };
            if !task::phase_done(plan, phase, &done)
                || self.store.is_gate_approved(project_id, &gate.gate_id)?
            {
                continue;
            }
            self.store
                .upsert_gate_approval(&GateApproval::automatic(project_id, &gate.gate_id, phase))?;
            tracing::info!(project_id, gate_id = %gate.gate_id, %phase, "gate auto-approved");
            approved.push(gate.gate_id.clone());
        }
        Ok(approved)
    }

    /// Recompute counters from `log` and derive the run status from `next`.
    pub fn sync_run(
        &self,
        run: &mut RunRecord,
        plan: &Plan,
        log: &[TaskRun],
        next: &NextTask,
    ) -> Result<()> {
        let counters = task::summarize(plan, log);
        run.planned = counters.planned;
        run.executed = counters.executed;
        run.skipped = counters.skipped;
        run.failed = counters.failed;
        run.current_phase = counters.current_phase;
        match next {
            NextTask::AllComplete { .. } => {
                run.pending_gates.clear();
                run.failure = None;
                run.finish(RunStatus::Completed);
                tracing::info!(
                    run_id = %run.run_id,
                    executed = run.executed,
                    skipped = run.skipped,
                    "run completed"
                );
            }
            NextTask::Blocked { gate_id, .. } => {
                run.pending_gates = vec![gate_id.clone()];
                run.status = RunStatus::Blocked;
                run.ended_at = None;
            }
            NextTask::Ready { .. } | NextTask::NoPlan => {
                run.pending_gates.clear();
                run.status = RunStatus::Running;
                run.failure = None;
                run.ended_at = None;
            }
        }
        self.store.update_run(run)
    }

    /// Record a manual approval. A run blocked on this gate resumes.
    pub fn approve_gate(
        &self,
        project_id: &str,
        gate_id: &str,
        approved_by: &str,
        note: &str,
    ) -> Result<GateApproval> {
        let ctx = self.context(project_id)?;
        if let Some(ctx) = &ctx {
            if ctx.plan.plan.gate(gate_id).is_none() {
                return Err(AutopilotError::GateNotFound(gate_id.to_string()));
            }
        }
        let approval = GateApproval::new(project_id, gate_id, approved_by, note);
        self.store.upsert_gate_approval(&approval)?;
        tracing::info!(project_id, gate_id, approved_by, "gate approved");

        if let Some(RunContext {
            plan,
            run: Some(mut run),
            log,
        }) = ctx
        {
            if run.status == RunStatus::Blocked && run.pending_gates.iter().any(|g| g == gate_id) {
                let next = self.next_in_plan(project_id, &plan.plan, &log)?;
                self.sync_run(&mut run, &plan.plan, &log, &next)?;
            }
        }
        Ok(approval)
    }

    pub fn checklist(&self, project_id: &str) -> Result<Checklist> {
        let Some(ctx) = self.context(project_id)? else {
            return Ok(Checklist {
                phases: Vec::new(),
                completed: 0,
                total: 0,
                text: "No plan found.".to_string(),
            });
        };
        let plan = &ctx.plan.plan;
        let states = task::task_states(&ctx.log);
        let done: BTreeSet<&str> = task::done_set(&ctx.log);

        let mut phases = Vec::new();
        let mut found_current = false;
        for phase in &plan.phases {
            let blocked = self.blocking_gate(project_id, plan, phase.name)?.is_some();
            let mut items = Vec::new();
            let mut phase_blocked_pending = false;
            for t in &phase.tasks {
                let status = match states.get(t.task_id.as_str()) {
                    Some(TaskRunStatus::Completed) => ItemStatus::Completed,
                    Some(TaskRunStatus::Skipped) => ItemStatus::Skipped,
                    _ if blocked && !found_current => {
                        phase_blocked_pending = true;
                        ItemStatus::Blocked
                    }
                    Some(TaskRunStatus::Failed) => {
                        found_current = true;
                        ItemStatus::Failed
                    }
                    None if !found_current => {
                        found_current = true;
                        ItemStatus::Current
                    }
                    None => ItemStatus::Pending,
                };
                items.push(ChecklistItem {
                    task_id: t.task_id.clone(),
                    title: t.title.clone(),
                    status,
                    marker: status.marker().to_string(),
                });
            }
            if phase_blocked_pending {
                found_current = true;
            }
            phases.push(ChecklistPhase {
                phase: phase.name,
                tasks: items,
            });
        }

        let total = plan.total_tasks();
        let completed = plan
            .tasks()
            .filter(|t| done.contains(t.task_id.as_str()))
            .count();
        let mut text = format!("# Task Progress: {completed}/{total} complete\n");
        for phase in &phases {
            let _ = write!(text, "\n## {}\n", phase.phase.title());
            for item in &phase.tasks {
                let _ = writeln!(text, "  {} {}", item.marker, item.title);
            }
        }
        Ok(Checklist {
            phases,
            completed,
            total,
            text,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
