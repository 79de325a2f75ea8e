use crate::adapter::{AdapterResult, AdapterSet};
use crate::error::{AutopilotError, Result};
use crate::router::SkillReason;
use crate::store::{AuditEvent, LeaseRecord, Store};
use crate::types::{EndReason, Host, LeaseStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Closed,
    /// Some hosts refused to deactivate; their leases stay active.
    PartialClose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndProjectOutcome {
    pub project_id: String,
    pub status: CloseStatus,
    /// Distinct (host, skill) pairs released.
    pub deactivated_skills: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_hosts: Vec<Host>,
}

/// Skills per host among `leases`.
fn group_by_host(leases: &[LeaseRecord]) -> BTreeMap<Host, BTreeSet<String>> {
    let mut grouped: BTreeMap<Host, BTreeSet<String>> = BTreeMap::new();
    for lease in leases {
        grouped
            .entry(lease.host)
            .or_default()
            .insert(lease.skill_id.clone());
    }
    grouped
}

fn audit_payload(result: &AdapterResult, skill_count: usize) -> serde_json::Value {
    serde_json::json!({
        "host": result.host,
        "success": result.success,
        "message": result.message,
        "skill_count": skill_count,
    })
}

/// Keeps a project's active skill set in step with its host adapters.
pub struct LeaseManager {
    store: Arc<dyn Store>,
    adapters: AdapterSet,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>, adapters: AdapterSet, ttl_hours: u32) -> Self {
        Self {
            store,
            adapters,
            ttl: Duration::hours(i64::from(ttl_hours)),
        }
    }

    pub fn has_adapter(&self, host: Host) -> bool {
        self.adapters.contains_key(&host)
    }

    /// Release whatever the project holds, activate `selected` on every host
    /// in `hosts`, and replace the lease set with fresh leases.
    pub fn activate_project_skills(
        &self,
        project_id: &str,
        hosts: &[Host],
        selected: &[SkillReason],
    ) -> Result<Vec<AdapterResult>> {
        if let Some(missing) = hosts.iter().find(|h| !self.adapters.contains_key(*h)) {
            return Err(AutopilotError::UnknownHost(missing.to_string()));
        }

        let existing = self.store.active_leases(project_id)?;
        for (host, skills) in group_by_host(&existing) {
            let Some(adapter) = self.adapters.get(&host) else {
                continue;
            };
            let skill_ids: Vec<String> = skills.into_iter().collect();
            let result = adapter.deactivate(project_id, &skill_ids);
            self.store.append_audit(&AuditEvent::new(
                project_id,
                "adapter.deactivate.pre_activate",
                audit_payload(&result, skill_ids.len()),
            ))?;
        }

        let skill_ids: Vec<String> = selected.iter().map(|s| s.skill_id.clone()).collect();
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let mut results = Vec::new();
        let mut leases = Vec::new();
        let unique_hosts: BTreeSet<Host> = hosts.iter().copied().collect();
        for host in unique_hosts {
            let Some(adapter) = self.adapters.get(&host) else {
                continue;
            };
            let result = adapter.activate(project_id, &skill_ids);
            if !result.success {
                tracing::warn!(project_id, %host, message = %result.message, "skill activation failed");
            }
            self.store.append_audit(&AuditEvent::new(
                project_id,
                "adapter.activate",
                audit_payload(&result, skill_ids.len()),
            ))?;
            leases.extend(skill_ids.iter().map(|skill_id| LeaseRecord {
                lease_id: uuid::Uuid::new_v4().to_string(),
                project_id: project_id.to_string(),
                skill_id: skill_id.clone(),
                host,
                status: LeaseStatus::Active,
                created_at: now,
                expires_at,
            }));
            results.push(result);
        }

        self.store.replace_leases(project_id, &leases)?;
        tracing::info!(
            project_id,
            skills = skill_ids.len(),
            leases = leases.len(),
            "project skills activated"
        );
        Ok(results)
    }

    /// Deactivate every active lease, host by host. Hosts that fail keep
    /// their leases so a later call can retry just those.
    pub fn deactivate_project(&self, project_id: &str, reason: EndReason) -> Result<EndProjectOutcome> {
        let active = self.store.active_leases(project_id)?;
        let mut failed_hosts = Vec::new();

        for (host, skills) in group_by_host(&active) {
            let skill_ids: Vec<String> = skills.into_iter().collect();
            let result = match self.adapters.get(&host) {
                Some(adapter) => adapter.deactivate(project_id, &skill_ids),
                None => AdapterResult::failed(host, "no adapter configured"),
            };
            if !result.success {
                tracing::warn!(project_id, %host, message = %result.message, "skill deactivation failed");
                failed_hosts.push(host);
            }
            self.store.append_audit(&AuditEvent::new(
                project_id,
                "adapter.deactivate",
                audit_payload(&result, skill_ids.len()),
            ))?;
        }

        let released: Vec<&LeaseRecord> = active
            .iter()
            .filter(|l| !failed_hosts.contains(&l.host))
            .collect();
        let ids: Vec<String> = released.iter().map(|l| l.lease_id.clone()).collect();
        self.store.set_lease_status(&ids, LeaseStatus::Closed)?;
        let deactivated_skills = released
            .iter()
            .map(|l| (l.host, l.skill_id.as_str()))
            .collect::<BTreeSet<_>>()
            .len();

        let status = if failed_hosts.is_empty() {
            CloseStatus::Closed
        } else {
            CloseStatus::PartialClose
        };
        self.store.append_audit(&AuditEvent::new(
            project_id,
            "project.close",
            serde_json::json!({
                "reason": reason,
                "deactivated": deactivated_skills,
                "status": status,
                "failed_hosts": failed_hosts,
            }),
        ))?;
        tracing::info!(project_id, %reason, ?status, deactivated_skills, "project leases released");

        Ok(EndProjectOutcome {
            project_id: project_id.to_string(),
            status,
            deactivated_skills,
            failed_hosts,
        })
    }

    /// Projects holding at least one active lease that expired by `now`.
    pub fn expired_projects(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let expired = self.store.expired_active_leases(now)?;
        let ids: BTreeSet<String> = expired.into_iter().map(|l| l.project_id).collect();
        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{adapter_set, HostAdapter, MockAdapter};
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        claude: Arc<MockAdapter>,
        codex: Arc<MockAdapter>,
        manager: LeaseManager,
    }

    fn fixture(ttl_hours: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let claude = Arc::new(MockAdapter::new(Host::ClaudeDesktop, dir.path()));
        let codex = Arc::new(MockAdapter::new(Host::CodexDesktop, dir.path()));
        let adapters = adapter_set([
            claude.clone() as Arc<dyn HostAdapter>,
            codex.clone() as Arc<dyn HostAdapter>,
        ]);
        let manager = LeaseManager::new(store.clone(), adapters, ttl_hours);
        Fixture {
            _dir: dir,
            store,
            claude,
            codex,
            manager,
        }
    }

    fn picks(ids: &[&str]) -> Vec<SkillReason> {
        ids.iter()
            .map(|id| SkillReason {
                skill_id: id.to_string(),
                reason: "test".to_string(),
            })
            .collect()
    }

    #[test]
    fn activation_replaces_previous_set() {
        let f = fixture(24);
        f.manager
            .activate_project_skills("p1", Host::all(), &picks(&["core.a", "core.b"]))
            .unwrap();
        assert_eq!(f.store.active_leases("p1").unwrap().len(), 4);

        f.manager
            .activate_project_skills("p1", &[Host::ClaudeDesktop], &picks(&["core.c"]))
            .unwrap();
        let leases = f.store.active_leases("p1").unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].skill_id, "core.c");
        assert_eq!(f.claude.active_entries().unwrap(), vec!["p1:core.c".to_string()]);
        assert!(f.codex.active_entries().unwrap().is_empty());
    }

    #[test]
    fn close_reports_partial_failure() {
        let f = fixture(24);
        f.manager
            .activate_project_skills("p1", Host::all(), &picks(&["core.a"]))
            .unwrap();
        f.codex.fail_deactivate(true);

        let outcome = f.manager.deactivate_project("p1", EndReason::Completed).unwrap();
        assert_eq!(outcome.status, CloseStatus::PartialClose);
        assert_eq!(outcome.failed_hosts, vec![Host::CodexDesktop]);
        assert_eq!(outcome.deactivated_skills, 1);

        let remaining = f.store.active_leases("p1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].host, Host::CodexDesktop);

        f.codex.fail_deactivate(false);
        let retry = f.manager.deactivate_project("p1", EndReason::Completed).unwrap();
        assert_eq!(retry.status, CloseStatus::Closed);
        assert!(f.store.active_leases("p1").unwrap().is_empty());
    }

    #[test]
    fn close_without_leases_is_clean() {
        let f = fixture(24);
        let outcome = f.manager.deactivate_project("p1", EndReason::Cancelled).unwrap();
        assert_eq!(outcome.status, CloseStatus::Closed);
        assert_eq!(outcome.deactivated_skills, 0);
        let audit = f.store.list_audit("p1", 10).unwrap();
        assert_eq!(audit[0].event_type, "project.close");
    }

    #[test]
    fn zero_ttl_leases_are_expired() {
        let f = fixture(0);
        f.manager
            .activate_project_skills("p1", &[Host::ClaudeDesktop], &picks(&["core.a"]))
            .unwrap();
        f.manager
            .activate_project_skills("p2", &[Host::ClaudeDesktop], &picks(&["core.a"]))
            .unwrap();
        let expired = f.manager.expired_projects(Utc::now()).unwrap();
        assert_eq!(expired, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn missing_adapter_is_rejected_before_side_effects() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let adapters = adapter_set([
            Arc::new(MockAdapter::new(Host::ClaudeDesktop, dir.path())) as Arc<dyn HostAdapter>,
        ]);
        let manager = LeaseManager::new(store.clone(), adapters, 24);
        let err = manager
            .activate_project_skills("p1", Host::all(), &picks(&["core.a"]))
            .unwrap_err();
        assert!(matches!(err, AutopilotError::UnknownHost(_)));
        assert!(store.list_audit("p1", 10).unwrap().is_empty());
    }
}
