use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{
    AuditEvent, LeaseRecord, PlanRecord, ProjectRecord, RouteRecord, RunRecord, Store,
};
use crate::error::{AutopilotError, Result};
use crate::gate::GateApproval;
use crate::task::TaskRun;
use crate::types::{LeaseStatus, ProjectState};

#[derive(Default)]
struct Tables {
    projects: BTreeMap<String, ProjectRecord>,
    routes: Vec<RouteRecord>,
    plans: Vec<PlanRecord>,
    runs: Vec<RunRecord>,
    task_runs: BTreeMap<String, Vec<TaskRun>>,
    gate_approvals: BTreeMap<(String, String), GateApproval>,
    leases: BTreeMap<String, LeaseRecord>,
    audit: Vec<AuditEvent>,
}

/// Non-durable [`Store`] behind a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|e| AutopilotError::Store(e.to_string()))
    }
}

impl Store for MemoryStore {
    fn upsert_project(&self, project: &ProjectRecord) -> Result<()> {
        self.lock()?
            .projects
            .insert(project.project_id.clone(), project.clone());
        Ok(())
    }

    fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>> {
        Ok(self.lock()?.projects.get(project_id).cloned())
    }

    fn set_project_state(
        &self,
        project_id: &str,
        state: ProjectState,
        last_error: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.lock()?;
        let project = tables
            .projects
            .get_mut(project_id)
            .ok_or_else(|| AutopilotError::ProjectNotFound(project_id.to_string()))?;
        let now = Utc::now();
        project.state = state;
        project.updated_at = now;
        if state == ProjectState::Closed {
            project.ended_at = Some(now);
        }
        if let Some(err) = last_error {
            project.last_error = Some(err.to_string());
        }
        Ok(())
    }

    fn list_projects(&self, limit: usize) -> Result<Vec<ProjectRecord>> {
        let mut projects: Vec<ProjectRecord> = self.lock()?.projects.values().cloned().collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects.truncate(limit);
        Ok(projects)
    }

    fn insert_route(&self, route: &RouteRecord) -> Result<()> {
        self.lock()?.routes.push(route.clone());
        Ok(())
    }

    fn latest_route(&self, project_id: &str) -> Result<Option<RouteRecord>> {
        Ok(self
            .lock()?
            .routes
            .iter()
            .rev()
            .find(|r| r.project_id == project_id)
            .cloned())
    }

    fn list_routes(&self, project_id: &str) -> Result<Vec<RouteRecord>> {
        Ok(self
            .lock()?
            .routes
            .iter()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }

    fn insert_plan(&self, plan: &PlanRecord) -> Result<()> {
        self.lock()?.plans.push(plan.clone());
        Ok(())
    }

    fn get_plan(&self, plan_id: &str) -> Result<Option<PlanRecord>> {
        Ok(self
            .lock()?
            .plans
            .iter()
            .find(|p| p.plan_id == plan_id)
            .cloned())
    }

    fn latest_plan(&self, project_id: &str) -> Result<Option<PlanRecord>> {
        Ok(self
            .lock()?
            .plans
            .iter()
            .rev()
            .find(|p| p.project_id == project_id)
            .cloned())
    }

    fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.lock()?.runs.push(run.clone());
        Ok(())
    }

    fn update_run(&self, run: &RunRecord) -> Result<()> {
        let mut tables = self.lock()?;
        let slot = tables
            .runs
            .iter_mut()
            .find(|r| r.run_id == run.run_id)
            .ok_or_else(|| AutopilotError::RunNotFound(run.run_id.clone()))?;
        *slot = run.clone();
        Ok(())
    }

    fn latest_run(&self, project_id: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .lock()?
            .runs
            .iter()
            .rev()
            .find(|r| r.project_id == project_id)
            .cloned())
    }

    fn append_task_run(&self, task_run: &TaskRun) -> Result<u32> {
        let mut tables = self.lock()?;
        let log = tables.task_runs.entry(task_run.run_id.clone()).or_default();
        let seq = log.len() as u32 + 1;
        let mut stored = task_run.clone();
        stored.seq = seq;
        log.push(stored);
        Ok(seq)
    }

    fn list_task_runs(&self, run_id: &str) -> Result<Vec<TaskRun>> {
        Ok(self
            .lock()?
            .task_runs
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    fn upsert_gate_approval(&self, approval: &GateApproval) -> Result<()> {
        self.lock()?.gate_approvals.insert(
            (approval.project_id.clone(), approval.gate_id.clone()),
            approval.clone(),
        );
        Ok(())
    }

    fn gate_approval(&self, project_id: &str, gate_id: &str) -> Result<Option<GateApproval>> {
        Ok(self
            .lock()?
            .gate_approvals
            .get(&(project_id.to_string(), gate_id.to_string()))
            .cloned())
    }

    fn list_gate_approvals(&self, project_id: &str) -> Result<Vec<GateApproval>> {
        Ok(self
            .lock()?
            .gate_approvals
            .values()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect())
    }

    fn clear_gate_approvals(&self, project_id: &str) -> Result<()> {
        self.lock()?
            .gate_approvals
            .retain(|(project, _), _| project != project_id);
        Ok(())
    }

    fn replace_leases(&self, project_id: &str, leases: &[LeaseRecord]) -> Result<()> {
        let mut tables = self.lock()?;
        tables.leases.retain(|_, l| l.project_id != project_id);
        for lease in leases {
            tables.leases.insert(lease.lease_id.clone(), lease.clone());
        }
        Ok(())
    }

    fn active_leases(&self, project_id: &str) -> Result<Vec<LeaseRecord>> {
        let mut active: Vec<LeaseRecord> = self
            .lock()?
            .leases
            .values()
            .filter(|l| l.project_id == project_id && l.status == LeaseStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(active)
    }

    fn expired_active_leases(&self, now: DateTime<Utc>) -> Result<Vec<LeaseRecord>> {
        let mut expired: Vec<LeaseRecord> = self
            .lock()?
            .leases
            .values()
            .filter(|l| l.status == LeaseStatus::Active && l.expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(expired)
    }

    fn set_lease_status(&self, lease_ids: &[String], status: LeaseStatus) -> Result<()> {
        let mut tables = self.lock()?;
        for id in lease_ids {
            if let Some(lease) = tables.leases.get_mut(id) {
                lease.status = status;
            }
        }
        Ok(())
    }

    fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        self.lock()?.audit.push(event.clone());
        Ok(())
    }

    fn list_audit(&self, project_id: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .rev()
            .filter(|e| e.project_id == project_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn project_lifecycle() {
        contract::project_lifecycle(&MemoryStore::new());
    }

    #[test]
    fn latest_plan_and_route_follow_insert_order() {
        contract::latest_plan_and_route_follow_insert_order(&MemoryStore::new());
    }

    #[test]
    fn task_log_is_append_ordered() {
        contract::task_log_is_append_ordered(&MemoryStore::new());
    }

    #[test]
    fn gate_approvals_upsert() {
        contract::gate_approvals_upsert(&MemoryStore::new());
    }

    #[test]
    fn leases_replace_and_expire() {
        contract::leases_replace_and_expire(&MemoryStore::new());
    }

    #[test]
    fn audit_newest_first() {
        contract::audit_newest_first(&MemoryStore::new());
    }
}
