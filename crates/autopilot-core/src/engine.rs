//! Project lifecycle facade over the router, decomposer, store, lease manager,
//! task state machine and runner.

use crate::adapter::{adapter_set, AdapterResult, AdapterSet, HostAdapter, MockAdapter};
use crate::catalog::load_catalog;
use crate::config::Config;
use crate::decomposer::decompose;
use crate::error::{AutopilotError, Result};
use crate::executor::{ProjectRunner, RunOutcome};
use crate::gate::GateApproval;
use crate::intent::{read_brief, Intent, IndustryClassifier, IntentExtractor};
use crate::lease::{EndProjectOutcome, LeaseManager};
use crate::machine::{Checklist, NextTask, TaskOutcome, TaskStateMachine};
use crate::plan::{Plan, PLAN_FORMAT_VERSION};
use crate::router::{route, RouteResult};
use crate::store::{
    AuditEvent, PlanRecord, ProjectRecord, RedbStore, RouteRecord, RunRecord, Store,
};
use crate::task::TaskRun;
use crate::types::{EndReason, Host, ProjectState, RunStatus};
use crate::worker::WorkerPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Projects listed by [`Engine::history`].
pub const HISTORY_LIMIT: usize = 50;

const LOCK_SHARDS: usize = 16;

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartProjectOutcome {
    pub project_id: String,
    pub plan_id: String,
    pub route: RouteResult,
    pub activation: Vec<AdapterResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RerouteOutcome {
    /// The brief changed too little to justify a new route.
    Skipped,
    /// Only active projects are rerouted.
    Inactive { state: ProjectState },
    Applied {
        route_id: String,
        plan_id: String,
        selected_skill_count: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunRecord>,
    pub tasks: Vec<TaskRun>,
    pub approvals: Vec<GateApproval>,
}

impl TaskStatus {
    /// `not_started` until the project has a run.
    pub fn status(&self) -> String {
        self.run
            .as_ref()
            .map_or_else(|| "not_started".to_string(), |r| r.status.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub project_id: String,
    pub state: ProjectState,
    pub active_hosts: Vec<Host>,
    pub active_skill_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_route_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub project_id: String,
    pub workspace_path: PathBuf,
    pub state: ProjectState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub selected_skill_count: usize,
}

// ---------------------------------------------------------------------------
// Per-project locks
// ---------------------------------------------------------------------------

/// One mutex per project id, spread over shards so lookups for different
/// projects rarely touch the same map.
struct ProjectLocks {
    shards: Vec<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ProjectLocks {
    fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, project_id: &str) -> &Mutex<HashMap<String, Arc<Mutex<()>>>> {
        let mut hasher = DefaultHasher::new();
        project_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn for_project(&self, project_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut map = self
            .shard(project_id)
            .lock()
            .map_err(|e| AutopilotError::Store(format!("project lock table poisoned: {e}")))?;
        Ok(map.entry(project_id.to_string()).or_default().clone())
    }

    /// Drop the entry for `project_id` once nobody else holds its mutex.
    fn release(&self, project_id: &str) {
        let Ok(mut map) = self.shard(project_id).lock() else {
            return;
        };
        if map
            .get(project_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(project_id);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().map(|m| m.len()).unwrap_or(0))
            .sum()
    }
}

/// Lock a project mutex, recovering it if a holder panicked.
pub(crate) fn acquire(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config: Config,
    store: Arc<dyn Store>,
    leases: LeaseManager,
    pool: WorkerPool,
    extractor: IntentExtractor,
    locks: ProjectLocks,
}

impl Engine {
    /// Open the redb store named by `config` and serve every host with a mock
    /// adapter whose state lives next to the database.
    pub fn open(config: Config) -> Result<Self> {
        let db_path = config.resolved_db_path()?;
        let store = Arc::new(RedbStore::open(&db_path)?);
        let state_dir = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let adapters = adapter_set(
            Host::all()
                .iter()
                .map(|h| Arc::new(MockAdapter::new(*h, &state_dir)) as Arc<dyn HostAdapter>),
        );
        tracing::info!(db = %db_path.display(), "engine opened");
        Self::with_parts(config, store, adapters)
    }

    pub fn with_parts(config: Config, store: Arc<dyn Store>, adapters: AdapterSet) -> Result<Self> {
        for warning in config.validate() {
            tracing::warn!(level = ?warning.level, message = %warning.message, "config warning");
        }
        let pool = WorkerPool::from_config(&config, adapters.clone())?;
        let leases = LeaseManager::new(store.clone(), adapters, config.policy.lease_ttl_hours);
        Ok(Self {
            config,
            store,
            leases,
            pool,
            extractor: IntentExtractor::new(),
            locks: ProjectLocks::new(),
        })
    }

    /// Consult `classifier` for the industry before the keyword table.
    pub fn with_classifier(mut self, classifier: Box<dyn IndustryClassifier>) -> Self {
        self.extractor = IntentExtractor::with_classifier(classifier);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    fn machine(&self) -> TaskStateMachine<'_> {
        TaskStateMachine::new(self.store.as_ref())
    }

    fn project(&self, project_id: &str) -> Result<ProjectRecord> {
        self.store
            .get_project(project_id)?
            .ok_or_else(|| AutopilotError::ProjectNotFound(project_id.to_string()))
    }

    fn check_hosts(&self, hosts: &[Host]) -> Result<()> {
        match hosts.iter().find(|h| !self.leases.has_adapter(**h)) {
            Some(missing) => Err(AutopilotError::UnknownHost(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Route `intent` against a fresh catalog snapshot and decompose the
    /// selection into a plan.
    fn route_and_plan(&self, intent: &Intent, hosts: &[Host]) -> Result<(RouteResult, Plan)> {
        let catalog = load_catalog(&self.config.catalogs)?;
        let routed = route(
            intent,
            &catalog.skills,
            hosts,
            &self.config.policy,
            &catalog.snapshot_hash,
        )?;
        let plan = decompose(intent, &routed.selected_skills);
        Ok((routed, plan))
    }

    fn record_route(
        &self,
        project_id: &str,
        routed: &RouteResult,
        intent: Intent,
        intent_hash: String,
        plan: &Plan,
    ) -> Result<()> {
        self.store.insert_route(&RouteRecord {
            project_id: project_id.to_string(),
            route: routed.clone(),
            intent,
            intent_hash,
            created_at: Utc::now(),
        })?;
        self.store.insert_plan(&PlanRecord {
            plan_id: plan.plan_id.clone(),
            project_id: project_id.to_string(),
            route_id: routed.route_id.clone(),
            format_version: PLAN_FORMAT_VERSION,
            plan: plan.clone(),
            created_at: Utc::now(),
        })
    }

    /// Terminate the project's open run, if any.
    fn terminate_open_run(&self, project_id: &str) -> Result<Option<String>> {
        match self.store.latest_run(project_id)? {
            Some(mut run) if !run.status.is_terminal() => {
                run.finish(RunStatus::Terminated);
                self.store.update_run(&run)?;
                tracing::info!(project_id, run_id = %run.run_id, "run terminated");
                Ok(Some(run.run_id))
            }
            _ => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Parse the brief, route, plan, persist, and activate the selection on
    /// `hosts`. An empty host list means every known host.
    pub fn start_project(
        &self,
        workspace_path: &Path,
        brief: &str,
        hosts: &[Host],
    ) -> Result<StartProjectOutcome> {
        let hosts: Vec<Host> = if hosts.is_empty() {
            Host::all().to_vec()
        } else {
            hosts.to_vec()
        };
        self.check_hosts(&hosts)?;

        let (text, brief_path) = read_brief(brief)?;
        let intent = self.extractor.extract(&text)?;
        let intent_hash = intent.hash()?;
        let (routed, plan) = self.route_and_plan(&intent, &hosts)?;

        let project = ProjectRecord::new(
            workspace_path.to_path_buf(),
            brief_path.clone(),
            hosts.clone(),
            ProjectState::Active,
        );
        let project_id = project.project_id.clone();
        let lock = self.locks.for_project(&project_id)?;
        let _guard = acquire(&lock);

        self.store.upsert_project(&project)?;
        self.record_route(&project_id, &routed, intent, intent_hash, &plan)?;
        let activation = self
            .leases
            .activate_project_skills(&project_id, &hosts, &routed.selected_skills)?;

        self.store.append_audit(
            &AuditEvent::new(
                &project_id,
                "project.start",
                serde_json::json!({
                    "workspace_path": workspace_path.display().to_string(),
                    "brief_path": brief_path.display().to_string(),
                    "host_targets": hosts,
                    "selected_skill_count": routed.selected_skills.len(),
                    "rejected_skill_count": routed.rejected_skills.len(),
                }),
            )
            .with_route(&routed.route_id),
        )?;
        tracing::info!(
            project_id = %project_id,
            route_id = %routed.route_id,
            plan_hash = %routed.plan_hash,
            selected = routed.selected_skills.len(),
            rejected = routed.rejected_skills.len(),
            "project started"
        );

        Ok(StartProjectOutcome {
            project_id,
            plan_id: plan.plan_id,
            route: routed,
            activation,
        })
    }

    /// Re-read the brief and, when the intent moved materially, route again,
    /// store a new plan, swap the leases and restart gating from scratch.
    pub fn reroute_if_material_change(&self, project_id: &str) -> Result<RerouteOutcome> {
        let lock = self.locks.for_project(project_id)?;
        let _guard = acquire(&lock);

        let project = self.project(project_id)?;
        if project.state != ProjectState::Active {
            return Ok(RerouteOutcome::Inactive {
                state: project.state,
            });
        }

        let (text, _) = read_brief(&project.brief_path.to_string_lossy())?;
        let intent = self.extractor.extract(&text)?;
        if let Some(previous) = self.store.latest_route(project_id)? {
            if !previous.intent.is_material_change(&intent) {
                self.store.append_audit(&AuditEvent::new(
                    project_id,
                    "project.reroute.skipped",
                    serde_json::json!({ "reason": "non_material_change" }),
                ))?;
                tracing::debug!(project_id, "brief change not material");
                return Ok(RerouteOutcome::Skipped);
            }
        }

        let mut hosts = self.store.active_hosts(project_id)?;
        if hosts.is_empty() {
            hosts = project.host_targets.clone();
        }
        let intent_hash = intent.hash()?;
        let (routed, plan) = self.route_and_plan(&intent, &hosts)?;
        self.record_route(project_id, &routed, intent, intent_hash, &plan)?;
        self.leases
            .activate_project_skills(project_id, &hosts, &routed.selected_skills)?;
        let terminated = self.terminate_open_run(project_id)?;
        self.store.clear_gate_approvals(project_id)?;

        self.store.append_audit(
            &AuditEvent::new(
                project_id,
                "project.reroute.applied",
                serde_json::json!({
                    "plan_id": plan.plan_id,
                    "selected_skill_count": routed.selected_skills.len(),
                    "terminated_run_id": terminated,
                }),
            )
            .with_route(&routed.route_id),
        )?;
        tracing::info!(
            project_id,
            route_id = %routed.route_id,
            plan_id = %plan.plan_id,
            "project rerouted"
        );

        Ok(RerouteOutcome::Applied {
            route_id: routed.route_id,
            plan_id: plan.plan_id,
            selected_skill_count: routed.selected_skills.len(),
        })
    }

    /// Release the project's skills and close it. A partial close still
    /// closes the project; the failed hosts keep their leases for a retry.
    pub fn end_project(&self, project_id: &str, reason: EndReason) -> Result<EndProjectOutcome> {
        let lock = self.locks.for_project(project_id)?;
        let outcome = {
            let _guard = acquire(&lock);
            self.end_locked(project_id, reason)
        };
        drop(lock);
        self.locks.release(project_id);
        outcome
    }

    fn end_locked(&self, project_id: &str, reason: EndReason) -> Result<EndProjectOutcome> {
        self.project(project_id)?;
        self.store
            .set_project_state(project_id, ProjectState::Closing, None)?;
        let outcome = match self.leases.deactivate_project(project_id, reason) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.store
                    .set_project_state(project_id, ProjectState::Error, Some(&e.to_string()))?;
                return Err(e);
            }
        };
        self.terminate_open_run(project_id)?;
        self.store
            .set_project_state(project_id, ProjectState::Closed, None)?;
        tracing::info!(project_id, %reason, status = ?outcome.status, "project ended");
        Ok(outcome)
    }

    /// End every project holding an expired lease.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<EndProjectOutcome>> {
        let mut ended = Vec::new();
        for project_id in self.leases.expired_projects(now)? {
            match self.end_project(&project_id, EndReason::TtlExpiry) {
                Ok(outcome) => ended.push(outcome),
                Err(e) => tracing::warn!(project_id = %project_id, error = %e, "lease sweep failed"),
            }
        }
        Ok(ended)
    }

    // -----------------------------------------------------------------------
    // Gates and tasks
    // -----------------------------------------------------------------------

    pub fn approve_gate(
        &self,
        project_id: &str,
        gate_id: &str,
        approved_by: &str,
        note: &str,
    ) -> Result<GateApproval> {
        let lock = self.locks.for_project(project_id)?;
        let _guard = acquire(&lock);

        self.project(project_id)?;
        let approval = self
            .machine()
            .approve_gate(project_id, gate_id, approved_by, note)?;
        self.store.append_audit(&AuditEvent::new(
            project_id,
            "project.gate.approved",
            serde_json::json!({
                "gate_id": gate_id,
                "approved_by": approved_by,
                "note": note,
            }),
        ))?;
        Ok(approval)
    }

    pub fn start_run(&self, project_id: &str) -> Result<RunRecord> {
        let lock = self.locks.for_project(project_id)?;
        let _guard = acquire(&lock);
        self.project(project_id)?;
        self.machine().start_run(project_id)
    }

    pub fn next_task(&self, project_id: &str) -> Result<NextTask> {
        self.machine().next_task(project_id)
    }

    pub fn complete_task(
        &self,
        project_id: &str,
        task_id: &str,
        summary: &str,
        artifacts: &[String],
        evidence: serde_json::Value,
    ) -> Result<TaskOutcome> {
        let lock = self.locks.for_project(project_id)?;
        let _guard = acquire(&lock);
        self.machine()
            .complete_task(project_id, task_id, summary, artifacts, evidence)
    }

    pub fn skip_task(&self, project_id: &str, task_id: &str, reason: &str) -> Result<TaskOutcome> {
        let lock = self.locks.for_project(project_id)?;
        let _guard = acquire(&lock);
        self.machine().skip_task(project_id, task_id, reason)
    }

    pub fn fail_task(&self, project_id: &str, task_id: &str, error: &str) -> Result<TaskOutcome> {
        let lock = self.locks.for_project(project_id)?;
        let _guard = acquire(&lock);
        self.machine().fail_task(project_id, task_id, error)
    }

    pub fn checklist(&self, project_id: &str) -> Result<Checklist> {
        self.machine().checklist(project_id)
    }

    /// Execute the project's remaining tasks. `auto_approve` falls back to
    /// the configured default.
    pub async fn run_project(
        &self,
        project_id: &str,
        auto_approve: Option<bool>,
    ) -> Result<RunOutcome> {
        let auto_approve = auto_approve.unwrap_or(self.config.auto_approve_gates);
        ProjectRunner::new(self.store.as_ref(), &self.pool)
            .with_lock(self.locks.for_project(project_id)?)
            .run_project(project_id, auto_approve)
            .await
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn task_status(&self, project_id: &str) -> Result<TaskStatus> {
        self.project(project_id)?;
        let run = self.store.latest_run(project_id)?;
        let tasks = match &run {
            Some(r) => self.store.list_task_runs(&r.run_id)?,
            None => Vec::new(),
        };
        Ok(TaskStatus {
            project_id: project_id.to_string(),
            run,
            tasks,
            approvals: self.store.list_gate_approvals(project_id)?,
        })
    }

    pub fn project_status(&self, project_id: &str) -> Result<ProjectStatus> {
        let project = self.project(project_id)?;
        Ok(ProjectStatus {
            project_id: project.project_id,
            state: project.state,
            active_hosts: self.store.active_hosts(project_id)?,
            active_skill_count: self.store.active_skill_count(project_id)?,
            last_route_at: self.store.latest_route(project_id)?.map(|r| r.created_at),
            last_error: project.last_error,
        })
    }

    /// Most recent projects first.
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.store
            .list_projects(HISTORY_LIMIT)?
            .into_iter()
            .map(|p| {
                Ok(HistoryEntry {
                    selected_skill_count: self.store.active_skill_count(&p.project_id)?,
                    project_id: p.project_id,
                    workspace_path: p.workspace_path,
                    state: p.state,
                    created_at: p.created_at,
                    updated_at: p.updated_at,
                })
            })
            .collect()
    }

    pub fn audit(&self, project_id: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        self.store.list_audit(project_id, limit)
    }
}
