//! Whole-project execution: phases run in order, the tasks of one phase run
//! concurrently, and every gate is checked before its phase starts.

use crate::engine::acquire;
use crate::error::{AutopilotError, Result};
use crate::machine::{NextTask, TaskStateMachine};
use crate::plan::PlanTask;
use crate::store::{AuditEvent, ProjectRecord, RunFailure, RunRecord, Store};
use crate::task;
use crate::types::RunStatus;
use crate::worker::{PhaseJob, WorkerPool};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run: RunRecord,
    /// Tasks dispatched by this call, failures included.
    pub dispatched: usize,
    /// Gates approved by this call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approved_gates: Vec<String>,
}

pub struct ProjectRunner<'a> {
    store: &'a dyn Store,
    pool: &'a WorkerPool,
    lock: Option<Arc<Mutex<()>>>,
}

impl<'a> ProjectRunner<'a> {
    pub fn new(store: &'a dyn Store, pool: &'a WorkerPool) -> Self {
        Self {
            store,
            pool,
            lock: None,
        }
    }

    /// Hold `lock` around every run-record write. Never held while tasks
    /// execute.
    pub fn with_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.lock = Some(lock);
        self
    }

    fn hold(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.as_deref().map(acquire)
    }

    /// Drive the project's open run as far as it goes: to completion, to the
    /// first failed task, to a gate that needs a manual approval, or until
    /// the run is ended from outside.
    pub async fn run_project(&self, project_id: &str, auto_approve: bool) -> Result<RunOutcome> {
        let (mut run, project) = {
            let _guard = self.hold();
            let project = self.executable_project(project_id)?;
            (TaskStateMachine::new(self.store).ensure_run(project_id)?, project)
        };
        let machine = TaskStateMachine::new(self.store);
        let plan = self
            .store
            .get_plan(&run.plan_id)?
            .ok_or_else(|| AutopilotError::PlanNotFound(run.plan_id.clone()))?
            .plan;
        let selected_skills: Vec<String> = self
            .store
            .latest_route(project_id)?
            .map(|r| r.route.selected_ids().into_iter().map(str::to_string).collect())
            .unwrap_or_default();
        let job = PhaseJob {
            project_id: project_id.to_string(),
            workspace_path: project.workspace_path.clone(),
            selected_skills,
        };
        tracing::info!(project_id, run_id = %run.run_id, auto_approve, "project run started");

        let mut dispatched = 0;
        let mut approved_gates = Vec::new();

        for phase in &plan.phases {
            let pending = {
                let _guard = self.hold();
                if let Some(ended) = self.ended_elsewhere(project_id, &run)? {
                    return self.finish(ended, dispatched, approved_gates);
                }
                let log = self.store.list_task_runs(&run.run_id)?;
                let done = task::done_set(&log);
                let pending: Vec<PlanTask> = phase
                    .tasks
                    .iter()
                    .filter(|t| !done.contains(t.task_id.as_str()))
                    .cloned()
                    .collect();
                if pending.is_empty() {
                    continue;
                }

                if auto_approve {
                    approved_gates.extend(machine.approve_finished_phases(project_id, &plan, &log)?);
                }
                let next = machine.next_in_plan(project_id, &plan, &log)?;
                // Also revives a resumed run that had failed or blocked.
                machine.sync_run(&mut run, &plan, &log, &next)?;
                if let NextTask::Blocked { gate_id, .. } = &next {
                    tracing::info!(project_id, gate_id = %gate_id, phase = %phase.name, "run waiting on gate");
                    return self.finish(run, dispatched, approved_gates);
                }
                pending
            };

            tracing::info!(project_id, phase = %phase.name, tasks = pending.len(), "executing phase");
            let run_id = run.run_id.clone();
            let results = self
                .pool
                .execute_phase(&job, &pending, |result| {
                    self.store
                        .append_task_run(&result.to_task_run(&run_id, project_id))
                        .map(|_| ())
                })
                .await?;
            dispatched += results.len();

            if let Some(failed) = results.iter().find(|r| r.is_failed()) {
                let _guard = self.hold();
                if let Some(ended) = self.ended_elsewhere(project_id, &run)? {
                    return self.finish(ended, dispatched, approved_gates);
                }
                let log = self.store.list_task_runs(&run.run_id)?;
                let next = machine.next_in_plan(project_id, &plan, &log)?;
                machine.sync_run(&mut run, &plan, &log, &next)?;
                run.failure = Some(RunFailure {
                    task_id: failed.task.task_id.clone(),
                    host: Some(failed.host),
                    error: failed.error.clone().unwrap_or_default(),
                });
                run.pending_gates.clear();
                run.finish(RunStatus::Failed);
                self.store.update_run(&run)?;
                tracing::warn!(
                    project_id,
                    task_id = %failed.task.task_id,
                    host = %failed.host,
                    "run halted on failed task"
                );
                return self.finish(run, dispatched, approved_gates);
            }
        }

        let _guard = self.hold();
        if let Some(ended) = self.ended_elsewhere(project_id, &run)? {
            return self.finish(ended, dispatched, approved_gates);
        }
        let log = self.store.list_task_runs(&run.run_id)?;
        if auto_approve {
            approved_gates.extend(machine.approve_finished_phases(project_id, &plan, &log)?);
        }
        let next = machine.next_in_plan(project_id, &plan, &log)?;
        machine.sync_run(&mut run, &plan, &log, &next)?;
        self.finish(run, dispatched, approved_gates)
    }

    fn executable_project(&self, project_id: &str) -> Result<ProjectRecord> {
        let project = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| AutopilotError::ProjectNotFound(project_id.to_string()))?;
        if !project.state.is_executable() {
            return Err(AutopilotError::ProjectNotExecutable {
                project_id: project_id.to_string(),
                state: project.state.to_string(),
            });
        }
        Ok(project)
    }

    /// The stored run when `run` was terminated or replaced since it was
    /// loaded. Fails once the project itself stops being executable.
    fn ended_elsewhere(&self, project_id: &str, run: &RunRecord) -> Result<Option<RunRecord>> {
        let stored = self.store.latest_run(project_id)?;
        let ended = match stored {
            Some(stored) if stored.run_id == run.run_id => {
                (stored.status == RunStatus::Terminated).then_some(stored)
            }
            _ => {
                let mut replaced = run.clone();
                replaced.finish(RunStatus::Terminated);
                Some(replaced)
            }
        };
        if let Some(ended) = ended {
            tracing::info!(project_id, run_id = %ended.run_id, "run ended elsewhere, stopping");
            return Ok(Some(ended));
        }
        self.executable_project(project_id)?;
        Ok(None)
    }

    fn finish(
        &self,
        run: RunRecord,
        dispatched: usize,
        approved_gates: Vec<String>,
    ) -> Result<RunOutcome> {
        self.store.append_audit(&AuditEvent::new(
            &run.project_id,
            "project.run.completed",
            serde_json::json!({
                "run_id": run.run_id,
                "status": run.status,
                "dispatched": dispatched,
                "executed": run.executed,
                "failed": run.failed,
                "pending_gates": run.pending_gates,
                "approved_gates": approved_gates,
                "failure": run.failure,
            }),
        ))?;
        tracing::info!(
            project_id = %run.project_id,
            run_id = %run.run_id,
            status = %run.status,
            dispatched,
            "project run finished"
        );
        Ok(RunOutcome {
            run,
            dispatched,
            approved_gates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{adapter_set, HostAdapter, MockAdapter};
    use crate::decomposer::decompose;
    use crate::gate::{DISCOVERY_GATE, QUALITY_GATE};
    use crate::intent::extract_intent;
    use crate::plan::{Plan, PLAN_FORMAT_VERSION};
    use crate::store::{MemoryStore, PlanRecord};
    use crate::types::{Host, Phase, ProjectState, TaskRunStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: MemoryStore,
        claude: Arc<MockAdapter>,
        pool: WorkerPool,
        project_id: String,
        plan: Plan,
    }

    fn fixture(state: ProjectState) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let project = ProjectRecord::new(
            dir.path().to_path_buf(),
            PathBuf::from("project_brief.md"),
            vec![Host::ClaudeDesktop],
            state,
        );
        store.upsert_project(&project).unwrap();
        let intent = extract_intent(
            "# Goals\n- Launch an analytics dashboard for retail store managers.\n# Deliverables\n- Dashboard",
        )
        .unwrap();
        let plan = decompose(&intent, &[]);
        store
            .insert_plan(&PlanRecord {
                plan_id: plan.plan_id.clone(),
                project_id: project.project_id.clone(),
                route_id: "route".to_string(),
                format_version: PLAN_FORMAT_VERSION,
                plan: plan.clone(),
                created_at: Utc::now(),
            })
            .unwrap();

        let claude = Arc::new(MockAdapter::new(Host::ClaudeDesktop, dir.path()));
        let pool = WorkerPool::new(
            adapter_set([claude.clone() as Arc<dyn HostAdapter>]),
            BTreeMap::new(),
            3,
            Duration::from_secs(5),
        );
        Fixture {
            _dir: dir,
            store,
            claude,
            pool,
            project_id: project.project_id,
            plan,
        }
    }

    #[tokio::test]
    async fn auto_approve_runs_to_completion() {
        let f = fixture(ProjectState::Active);
        let runner = ProjectRunner::new(&f.store, &f.pool);
        let outcome = runner.run_project(&f.project_id, true).await.unwrap();

        assert_eq!(outcome.run.status, RunStatus::Completed);
        assert_eq!(outcome.dispatched, f.plan.total_tasks());
        assert_eq!(outcome.run.executed, f.plan.total_tasks());
        assert!(outcome.approved_gates.contains(&DISCOVERY_GATE.to_string()));
        assert!(outcome.approved_gates.contains(&QUALITY_GATE.to_string()));

        let log = f.store.list_task_runs(&outcome.run.run_id).unwrap();
        assert!(log.iter().all(|t| t.host == Some(Host::ClaudeDesktop)));
        let audit = f.store.list_audit(&f.project_id, 1).unwrap();
        assert_eq!(audit[0].event_type, "project.run.completed");
    }

    #[tokio::test]
    async fn manual_gates_stop_the_run() {
        let f = fixture(ProjectState::Active);
        let runner = ProjectRunner::new(&f.store, &f.pool);
        let outcome = runner.run_project(&f.project_id, false).await.unwrap();

        assert_eq!(outcome.run.status, RunStatus::Blocked);
        assert_eq!(outcome.run.pending_gates, vec![DISCOVERY_GATE.to_string()]);
        assert_eq!(
            outcome.dispatched,
            f.plan.phase_tasks(Phase::Discovery).len()
        );

        TaskStateMachine::new(&f.store)
            .approve_gate(&f.project_id, DISCOVERY_GATE, "lead", "ok")
            .unwrap();
        let resumed = runner.run_project(&f.project_id, false).await.unwrap();
        assert_eq!(resumed.run.run_id, outcome.run.run_id);
        assert_eq!(resumed.run.pending_gates, vec![QUALITY_GATE.to_string()]);
    }

    #[tokio::test]
    async fn failure_halts_and_resume_retries() {
        let f = fixture(ProjectState::Active);
        let build = f.plan.phase_tasks(Phase::Build);
        let victim = build[0].task_id.clone();
        f.claude.fail_task(&victim);

        let runner = ProjectRunner::new(&f.store, &f.pool);
        let outcome = runner.run_project(&f.project_id, true).await.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Failed);
        let failure = outcome.run.failure.clone().unwrap();
        assert_eq!(failure.task_id, victim);
        assert_eq!(failure.host, Some(Host::ClaudeDesktop));
        assert!(failure.error.contains("mock execution failed"));
        assert!(outcome.run.ended_at.is_some());

        // verify never started
        let log = f.store.list_task_runs(&outcome.run.run_id).unwrap();
        let verify = f.plan.phase_tasks(Phase::Verify);
        assert!(log.iter().all(|t| verify.iter().all(|v| v.task_id != t.task_id)));

        // a second pass against a healthy adapter picks up the same run
        let healthy = MockAdapter::new(Host::ClaudeDesktop, f._dir.path());
        let pool = WorkerPool::new(
            adapter_set([Arc::new(healthy) as Arc<dyn HostAdapter>]),
            BTreeMap::new(),
            3,
            Duration::from_secs(5),
        );
        let retried = ProjectRunner::new(&f.store, &pool)
            .run_project(&f.project_id, true)
            .await
            .unwrap();
        assert_eq!(retried.run.run_id, outcome.run.run_id);
        assert_eq!(retried.run.status, RunStatus::Completed);
        assert!(retried.run.failure.is_none());
        let log = f.store.list_task_runs(&retried.run.run_id).unwrap();
        assert_eq!(
            task::latest_status(&log, &victim),
            Some(TaskRunStatus::Completed)
        );
    }

    #[tokio::test]
    async fn run_ended_mid_phase_stays_terminated() {
        let f = fixture(ProjectState::Active);
        f.claude.delay_tasks(Duration::from_millis(150));
        let runner = ProjectRunner::new(&f.store, &f.pool);

        let end = async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let mut run = f.store.latest_run(&f.project_id).unwrap().unwrap();
            run.finish(RunStatus::Terminated);
            f.store.update_run(&run).unwrap();
            f.store
                .set_project_state(&f.project_id, ProjectState::Closed, None)
                .unwrap();
        };
        let (outcome, ()) = tokio::join!(runner.run_project(&f.project_id, true), end);
        let outcome = outcome.unwrap();

        assert_eq!(outcome.run.status, RunStatus::Terminated);
        assert_eq!(
            outcome.dispatched,
            f.plan.phase_tasks(Phase::Discovery).len()
        );
        let stored = f.store.latest_run(&f.project_id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Terminated);
        let log = f.store.list_task_runs(&stored.run_id).unwrap();
        assert!(log.len() < f.plan.total_tasks());
    }

    #[tokio::test]
    async fn project_closed_mid_phase_stops_the_run() {
        let f = fixture(ProjectState::Active);
        f.claude.delay_tasks(Duration::from_millis(150));
        let runner = ProjectRunner::new(&f.store, &f.pool);

        let close = async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            f.store
                .set_project_state(&f.project_id, ProjectState::Closed, None)
                .unwrap();
        };
        let (outcome, ()) = tokio::join!(runner.run_project(&f.project_id, true), close);

        assert!(matches!(
            outcome.unwrap_err(),
            AutopilotError::ProjectNotExecutable { .. }
        ));
        let stored = f.store.latest_run(&f.project_id).unwrap().unwrap();
        assert_ne!(stored.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn closed_project_is_not_executable() {
        let f = fixture(ProjectState::Closed);
        let err = ProjectRunner::new(&f.store, &f.pool)
            .run_project(&f.project_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, AutopilotError::ProjectNotExecutable { .. }));
    }
}
