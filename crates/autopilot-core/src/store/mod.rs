//! Durable state behind one contract.
//!
//! Routes, plans, task runs, and audit events are append-only. Projects and
//! runs are updated in place, gate approvals are upserted per
//! `(project_id, gate_id)`, and a project's lease set is replaced wholesale.

mod db;
mod memory;

pub use db::RedbStore;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::gate::GateApproval;
use crate::intent::Intent;
use crate::plan::Plan;
use crate::router::RouteResult;
use crate::task::TaskRun;
use crate::types::{Host, LeaseStatus, Phase, ProjectState, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project_id: String,
    pub workspace_path: PathBuf,
    pub brief_path: PathBuf,
    pub host_targets: Vec<Host>,
    pub state: ProjectState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProjectRecord {
    pub fn new(
        workspace_path: PathBuf,
        brief_path: PathBuf,
        host_targets: Vec<Host>,
        state: ProjectState,
    ) -> Self {
        let now = Utc::now();
        Self {
            project_id: uuid::Uuid::new_v4().to_string(),
            workspace_path,
            brief_path,
            host_targets,
            state,
            created_at: now,
            updated_at: now,
            ended_at: None,
            last_error: None,
        }
    }
}

/// A routing decision together with the intent it was computed from, so a
/// later material-change check survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub project_id: String,
    pub route: RouteResult,
    pub intent: Intent,
    pub intent_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub plan_id: String,
    pub project_id: String,
    pub route_id: String,
    pub format_version: u32,
    pub plan: Plan,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub project_id: String,
    pub plan_id: String,
    pub status: RunStatus,
    pub planned: usize,
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_gates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(project_id: &str, plan: &Plan) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            plan_id: plan.plan_id.clone(),
            status: RunStatus::Running,
            planned: plan.total_tasks(),
            executed: 0,
            skipped: 0,
            failed: 0,
            current_phase: plan.phases.first().map(|p| p.name),
            pending_gates: Vec::new(),
            failure: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Move to `status`, stamping `ended_at` for terminal states.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lease_id: String,
    pub project_id: String,
    pub skill_id: String,
    pub host: Host,
    pub status: LeaseStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(project_id: &str, event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            route_id: None,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_route(mut self, route_id: &str) -> Self {
        self.route_id = Some(route_id.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub trait Store: Send + Sync {
    // projects
    fn upsert_project(&self, project: &ProjectRecord) -> Result<()>;
    fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>>;
    /// Fails with `ProjectNotFound` for an unknown id. Stamps `ended_at` on close.
    fn set_project_state(
        &self,
        project_id: &str,
        state: ProjectState,
        last_error: Option<&str>,
    ) -> Result<()>;
    /// Newest first.
    fn list_projects(&self, limit: usize) -> Result<Vec<ProjectRecord>>;

    // routes
    fn insert_route(&self, route: &RouteRecord) -> Result<()>;
    fn latest_route(&self, project_id: &str) -> Result<Option<RouteRecord>>;
    /// Oldest first.
    fn list_routes(&self, project_id: &str) -> Result<Vec<RouteRecord>>;

    // plans
    fn insert_plan(&self, plan: &PlanRecord) -> Result<()>;
    fn get_plan(&self, plan_id: &str) -> Result<Option<PlanRecord>>;
    fn latest_plan(&self, project_id: &str) -> Result<Option<PlanRecord>>;

    // runs
    fn create_run(&self, run: &RunRecord) -> Result<()>;
    /// Fails with `RunNotFound` when the run was never created.
    fn update_run(&self, run: &RunRecord) -> Result<()>;
    fn latest_run(&self, project_id: &str) -> Result<Option<RunRecord>>;

    // task runs
    /// Append to the run's log; returns the assigned 1-based `seq`.
    fn append_task_run(&self, task_run: &TaskRun) -> Result<u32>;
    /// In append order.
    fn list_task_runs(&self, run_id: &str) -> Result<Vec<TaskRun>>;

    // gate approvals
    fn upsert_gate_approval(&self, approval: &GateApproval) -> Result<()>;
    fn gate_approval(&self, project_id: &str, gate_id: &str) -> Result<Option<GateApproval>>;
    fn list_gate_approvals(&self, project_id: &str) -> Result<Vec<GateApproval>>;
    fn clear_gate_approvals(&self, project_id: &str) -> Result<()>;

    // leases
    /// Drop every lease of the project, then insert `leases`.
    fn replace_leases(&self, project_id: &str, leases: &[LeaseRecord]) -> Result<()>;
    /// Active leases ordered by `expires_at`.
    fn active_leases(&self, project_id: &str) -> Result<Vec<LeaseRecord>>;
    fn expired_active_leases(&self, now: DateTime<Utc>) -> Result<Vec<LeaseRecord>>;
    fn set_lease_status(&self, lease_ids: &[String], status: LeaseStatus) -> Result<()>;

    // audit
    fn append_audit(&self, event: &AuditEvent) -> Result<()>;
    /// Newest first.
    fn list_audit(&self, project_id: &str, limit: usize) -> Result<Vec<AuditEvent>>;

    fn is_gate_approved(&self, project_id: &str, gate_id: &str) -> Result<bool> {
        Ok(self.gate_approval(project_id, gate_id)?.is_some())
    }

    /// Distinct skills with an active lease on any host.
    fn active_skill_count(&self, project_id: &str) -> Result<usize> {
        let leases = self.active_leases(project_id)?;
        let skills: std::collections::BTreeSet<&str> =
            leases.iter().map(|l| l.skill_id.as_str()).collect();
        Ok(skills.len())
    }

    fn active_hosts(&self, project_id: &str) -> Result<Vec<Host>> {
        let leases = self.active_leases(project_id)?;
        let hosts: std::collections::BTreeSet<Host> = leases.iter().map(|l| l.host).collect();
        Ok(hosts.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Contract tests shared by both implementations
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::decomposer::decompose;
    use crate::intent::extract_intent;
    use chrono::Duration;

    const BRIEF: &str =
        "# Goals\n- Launch a customer onboarding portal with analytics.\n# Deliverables\n- Portal service";

    fn project(store: &dyn Store) -> ProjectRecord {
        let record = ProjectRecord::new(
            PathBuf::from("/work"),
            PathBuf::from("/work/project_brief.md"),
            vec![Host::ClaudeDesktop],
            ProjectState::Active,
        );
        store.upsert_project(&record).unwrap();
        record
    }

    fn plan_record(project_id: &str) -> PlanRecord {
        let intent = extract_intent(BRIEF).unwrap();
        let plan = decompose(&intent, &[]);
        PlanRecord {
            plan_id: plan.plan_id.clone(),
            project_id: project_id.to_string(),
            route_id: "route".to_string(),
            format_version: crate::plan::PLAN_FORMAT_VERSION,
            plan,
            created_at: Utc::now(),
        }
    }

    fn lease(project_id: &str, skill: &str, host: Host, expires_in: Duration) -> LeaseRecord {
        let now = Utc::now();
        LeaseRecord {
            lease_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            skill_id: skill.to_string(),
            host,
            status: LeaseStatus::Active,
            created_at: now,
            expires_at: now + expires_in,
        }
    }

    pub fn project_lifecycle(store: &dyn Store) {
        let record = project(store);
        let loaded = store.get_project(&record.project_id).unwrap().unwrap();
        assert_eq!(loaded, record);

        store
            .set_project_state(&record.project_id, ProjectState::Closed, None)
            .unwrap();
        let closed = store.get_project(&record.project_id).unwrap().unwrap();
        assert_eq!(closed.state, ProjectState::Closed);
        assert!(closed.ended_at.is_some());

        let err = store
            .set_project_state("missing", ProjectState::Active, None)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_project("missing").unwrap().is_none());
    }

    pub fn latest_plan_and_route_follow_insert_order(store: &dyn Store) {
        let record = project(store);
        let first = plan_record(&record.project_id);
        let second = plan_record(&record.project_id);
        store.insert_plan(&first).unwrap();
        store.insert_plan(&second).unwrap();

        let latest = store.latest_plan(&record.project_id).unwrap().unwrap();
        assert_eq!(latest.plan_id, second.plan_id);
        assert_eq!(
            store.get_plan(&first.plan_id).unwrap().unwrap().plan_id,
            first.plan_id
        );

        let intent = extract_intent(BRIEF).unwrap();
        for n in 0..3 {
            let route = RouteRecord {
                project_id: record.project_id.clone(),
                route: RouteResult {
                    route_id: format!("route-{n}"),
                    plan_hash: "h".into(),
                    selected_skills: Vec::new(),
                    rejected_skills: Vec::new(),
                    snapshot_hash: "s".into(),
                },
                intent: intent.clone(),
                intent_hash: "i".into(),
                created_at: Utc::now(),
            };
            store.insert_route(&route).unwrap();
        }
        let latest = store.latest_route(&record.project_id).unwrap().unwrap();
        assert_eq!(latest.route.route_id, "route-2");
        assert_eq!(store.list_routes(&record.project_id).unwrap().len(), 3);
    }

    pub fn task_log_is_append_ordered(store: &dyn Store) {
        let record = project(store);
        let plan = plan_record(&record.project_id);
        let mut run = RunRecord::new(&record.project_id, &plan.plan);
        store.create_run(&run).unwrap();

        let tasks: Vec<_> = plan.plan.tasks().take(3).collect();
        for task in tasks.iter().rev() {
            let entry = TaskRun::completed(&run.run_id, &record.project_id, task, serde_json::Value::Null);
            store.append_task_run(&entry).unwrap();
        }
        let log = store.list_task_runs(&run.run_id).unwrap();
        let ids: Vec<&str> = log.iter().map(|t| t.task_id.as_str()).collect();
        let expected: Vec<&str> = tasks.iter().rev().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, expected);
        assert_eq!(log.iter().map(|t| t.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        run.executed = 3;
        run.finish(RunStatus::Completed);
        store.update_run(&run).unwrap();
        let latest = store.latest_run(&record.project_id).unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Completed);
        assert_eq!(latest.executed, 3);

        let ghost = RunRecord::new(&record.project_id, &plan.plan);
        assert!(store.update_run(&ghost).unwrap_err().is_not_found());
    }

    pub fn gate_approvals_upsert(store: &dyn Store) {
        let record = project(store);
        let pid = &record.project_id;
        assert!(!store.is_gate_approved(pid, "gate-1").unwrap());

        store
            .upsert_gate_approval(&GateApproval::new(pid, "gate-1", "alice", "first"))
            .unwrap();
        store
            .upsert_gate_approval(&GateApproval::new(pid, "gate-1", "bob", "second"))
            .unwrap();
        let approval = store.gate_approval(pid, "gate-1").unwrap().unwrap();
        assert_eq!(approval.approved_by, "bob");
        assert_eq!(store.list_gate_approvals(pid).unwrap().len(), 1);

        store.clear_gate_approvals(pid).unwrap();
        assert!(store.list_gate_approvals(pid).unwrap().is_empty());
    }

    pub fn leases_replace_and_expire(store: &dyn Store) {
        let record = project(store);
        let pid = &record.project_id;
        store
            .replace_leases(
                pid,
                &[
                    lease(pid, "core.a", Host::ClaudeDesktop, Duration::hours(2)),
                    lease(pid, "core.a", Host::CodexDesktop, Duration::hours(1)),
                ],
            )
            .unwrap();
        let active = store.active_leases(pid).unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].host, Host::CodexDesktop);
        assert_eq!(store.active_skill_count(pid).unwrap(), 1);
        assert_eq!(store.active_hosts(pid).unwrap().len(), 2);

        let stale = lease(pid, "core.b", Host::ClaudeDesktop, Duration::hours(-1));
        store.replace_leases(pid, &[stale.clone()]).unwrap();
        assert_eq!(store.active_leases(pid).unwrap().len(), 1);

        let expired = store.expired_active_leases(Utc::now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].lease_id, stale.lease_id);

        store
            .set_lease_status(&[stale.lease_id.clone()], LeaseStatus::Expired)
            .unwrap();
        assert!(store.active_leases(pid).unwrap().is_empty());
        assert!(store.expired_active_leases(Utc::now()).unwrap().is_empty());
    }

    pub fn audit_newest_first(store: &dyn Store) {
        let record = project(store);
        let pid = &record.project_id;
        for kind in ["project.start", "project.gate.approved", "project.end"] {
            store
                .append_audit(&AuditEvent::new(pid, kind, serde_json::json!({})))
                .unwrap();
        }
        store
            .append_audit(&AuditEvent::new("other", "project.start", serde_json::json!({})))
            .unwrap();
        let events = store.list_audit(pid, 2).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "project.end");
        assert_eq!(events[1].event_type, "project.gate.approved");
    }
}
