//! redb-backed [`Store`].
//!
//! # Table design
//!
//! Every table maps `&[u8]` keys to JSON values.
//!
//! Append-only tables (routes, plans, runs, audit) use a 24-byte key:
//! ```text
//! [ timestamp_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//! The timestamp is bumped past the table's last key when needed, so byte
//! order is append order even for writes within the same millisecond.
//!
//! `task_runs` is keyed `run_id \0 seq(u32 BE)`, making one run's log a single
//! contiguous range. `gate_approvals` is keyed `project_id \0 gate_id`;
//! projects and leases are keyed by their id.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::{
    AuditEvent, LeaseRecord, PlanRecord, ProjectRecord, RouteRecord, RunRecord, Store,
};
use crate::error::{AutopilotError, Result};
use crate::gate::GateApproval;
use crate::task::TaskRun;
use crate::types::{LeaseStatus, ProjectState};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

type BytesTable = TableDefinition<'static, &'static [u8], &'static [u8]>;
type OpenTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

const PROJECTS: BytesTable = TableDefinition::new("projects");
const ROUTES: BytesTable = TableDefinition::new("routes");
const PLANS: BytesTable = TableDefinition::new("plans");
const RUNS: BytesTable = TableDefinition::new("runs");
const TASK_RUNS: BytesTable = TableDefinition::new("task_runs");
const GATE_APPROVALS: BytesTable = TableDefinition::new("gate_approvals");
const LEASES: BytesTable = TableDefinition::new("leases");
const AUDIT: BytesTable = TableDefinition::new("audit");

const ALL_TABLES: [BytesTable; 8] = [
    PROJECTS,
    ROUTES,
    PLANS,
    RUNS,
    TASK_RUNS,
    GATE_APPROVALS,
    LEASES,
    AUDIT,
];

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn store_err(e: impl std::fmt::Display) -> AutopilotError {
    AutopilotError::Store(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(store_err)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(store_err)
}

/// Next chronological key, never sorting before the table's last entry.
fn append_key(table: &OpenTable<'_>, ts: DateTime<Utc>) -> Result<[u8; 24]> {
    let mut ms = ts.timestamp_millis().max(0) as u64;
    if let Some((last, _)) = table.last().map_err(store_err)? {
        let bytes = last.value();
        if bytes.len() >= 8 {
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&bytes[..8]);
            let last_ms = u64::from_be_bytes(prefix);
            if last_ms >= ms {
                ms = last_ms.saturating_add(1);
            }
        }
    }
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(Uuid::new_v4().as_bytes());
    Ok(key)
}

fn task_run_key(run_id: &str, seq: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(run_id.len() + 5);
    key.extend_from_slice(run_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn gate_key(project_id: &str, gate_id: &str) -> Vec<u8> {
    format!("{project_id}\0{gate_id}").into_bytes()
}

/// `[project_id \0, project_id \x01)` covers every gate of one project.
fn gate_range(project_id: &str) -> (Vec<u8>, Vec<u8>) {
    (
        format!("{project_id}\0").into_bytes(),
        format!("{project_id}\u{1}").into_bytes(),
    )
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        for def in ALL_TABLES {
            wt.open_table(def).map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let out = f(&wt)?;
        wt.commit().map_err(store_err)?;
        Ok(out)
    }

    fn read_all<T: DeserializeOwned>(&self, def: BytesTable) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(def).map_err(store_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    fn read_range<T: DeserializeOwned>(
        &self,
        def: BytesTable,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(def).map_err(store_err)?;
        let mut result = Vec::new();
        for entry in table.range(lo..hi).map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    fn read_one<T: DeserializeOwned>(&self, def: BytesTable, key: &[u8]) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(def).map_err(store_err)?;
        let value = table.get(key).map_err(store_err)?;
        match value {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn put(&self, def: BytesTable, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(|wt| {
            let mut table = wt.open_table(def).map_err(store_err)?;
            table.insert(key, value).map_err(store_err)?;
            Ok(())
        })
    }

    fn append<T: Serialize>(&self, def: BytesTable, ts: DateTime<Utc>, record: &T) -> Result<()> {
        let value = encode(record)?;
        self.write(|wt| {
            let mut table = wt.open_table(def).map_err(store_err)?;
            let key = append_key(&table, ts)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
            Ok(())
        })
    }
}

impl Store for RedbStore {
    fn upsert_project(&self, project: &ProjectRecord) -> Result<()> {
        self.put(PROJECTS, project.project_id.as_bytes(), &encode(project)?)
    }

    fn get_project(&self, project_id: &str) -> Result<Option<ProjectRecord>> {
        self.read_one(PROJECTS, project_id.as_bytes())
    }

    fn set_project_state(
        &self,
        project_id: &str,
        state: ProjectState,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.write(|wt| {
            let mut table = wt.open_table(PROJECTS).map_err(store_err)?;
            let existing: Option<ProjectRecord> =
                match table.get(project_id.as_bytes()).map_err(store_err)? {
                    Some(v) => Some(decode(v.value())?),
                    None => None,
                };
            let mut project =
                existing.ok_or_else(|| AutopilotError::ProjectNotFound(project_id.to_string()))?;
            let now = Utc::now();
            project.state = state;
            project.updated_at = now;
            if state == ProjectState::Closed {
                project.ended_at = Some(now);
            }
            if let Some(err) = last_error {
                project.last_error = Some(err.to_string());
            }
            let value = encode(&project)?;
            table
                .insert(project_id.as_bytes(), value.as_slice())
                .map_err(store_err)?;
            Ok(())
        })
    }

    fn list_projects(&self, limit: usize) -> Result<Vec<ProjectRecord>> {
        let mut projects: Vec<ProjectRecord> = self.read_all(PROJECTS)?;
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects.truncate(limit);
        Ok(projects)
    }

    fn insert_route(&self, route: &RouteRecord) -> Result<()> {
        self.append(ROUTES, route.created_at, route)
    }

    fn latest_route(&self, project_id: &str) -> Result<Option<RouteRecord>> {
        Ok(self.list_routes(project_id)?.pop())
    }

    fn list_routes(&self, project_id: &str) -> Result<Vec<RouteRecord>> {
        let routes: Vec<RouteRecord> = self.read_all(ROUTES)?;
        Ok(routes
            .into_iter()
            .filter(|r| r.project_id == project_id)
            .collect())
    }

    fn insert_plan(&self, plan: &PlanRecord) -> Result<()> {
        self.append(PLANS, plan.created_at, plan)
    }

    fn get_plan(&self, plan_id: &str) -> Result<Option<PlanRecord>> {
        let plans: Vec<PlanRecord> = self.read_all(PLANS)?;
        Ok(plans.into_iter().find(|p| p.plan_id == plan_id))
    }

    fn latest_plan(&self, project_id: &str) -> Result<Option<PlanRecord>> {
        let plans: Vec<PlanRecord> = self.read_all(PLANS)?;
        Ok(plans.into_iter().rev().find(|p| p.project_id == project_id))
    }

    fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.append(RUNS, run.started_at, run)
    }

    fn update_run(&self, run: &RunRecord) -> Result<()> {
        let value = encode(run)?;
        self.write(|wt| {
            let mut table = wt.open_table(RUNS).map_err(store_err)?;
            let mut found: Option<Vec<u8>> = None;
            for entry in table.iter().map_err(store_err)? {
                let (k, v) = entry.map_err(store_err)?;
                let existing: RunRecord = decode(v.value())?;
                if existing.run_id == run.run_id {
                    found = Some(k.value().to_vec());
                    break;
                }
            }
            let key = found.ok_or_else(|| AutopilotError::RunNotFound(run.run_id.clone()))?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
            Ok(())
        })
    }

    fn latest_run(&self, project_id: &str) -> Result<Option<RunRecord>> {
        let runs: Vec<RunRecord> = self.read_all(RUNS)?;
        Ok(runs.into_iter().rev().find(|r| r.project_id == project_id))
    }

    fn append_task_run(&self, task_run: &TaskRun) -> Result<u32> {
        self.write(|wt| {
            let mut table = wt.open_table(TASK_RUNS).map_err(store_err)?;
            let lo = task_run_key(&task_run.run_id, 0);
            let hi = task_run_key(&task_run.run_id, u32::MAX);
            let mut existing = table
                .range(lo.as_slice()..=hi.as_slice())
                .map_err(store_err)?;
            let last_seq = match existing.next_back() {
                Some(entry) => {
                    let (k, _) = entry.map_err(store_err)?;
                    let bytes = k.value();
                    let mut seq = [0u8; 4];
                    seq.copy_from_slice(&bytes[bytes.len() - 4..]);
                    u32::from_be_bytes(seq)
                }
                None => 0,
            };
            drop(existing);
            let seq = last_seq + 1;
            let mut stored = task_run.clone();
            stored.seq = seq;
            let key = task_run_key(&task_run.run_id, seq);
            let value = encode(&stored)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
            Ok(seq)
        })
    }

    fn list_task_runs(&self, run_id: &str) -> Result<Vec<TaskRun>> {
        let lo = task_run_key(run_id, 0);
        let mut hi = run_id.as_bytes().to_vec();
        hi.push(1);
        self.read_range(TASK_RUNS, &lo, &hi)
    }

    fn upsert_gate_approval(&self, approval: &GateApproval) -> Result<()> {
        self.put(
            GATE_APPROVALS,
            &gate_key(&approval.project_id, &approval.gate_id),
            &encode(approval)?,
        )
    }

    fn gate_approval(&self, project_id: &str, gate_id: &str) -> Result<Option<GateApproval>> {
        self.read_one(GATE_APPROVALS, &gate_key(project_id, gate_id))
    }

    fn list_gate_approvals(&self, project_id: &str) -> Result<Vec<GateApproval>> {
        let (lo, hi) = gate_range(project_id);
        self.read_range(GATE_APPROVALS, &lo, &hi)
    }

    fn clear_gate_approvals(&self, project_id: &str) -> Result<()> {
        let (lo, hi) = gate_range(project_id);
        self.write(|wt| {
            let mut table = wt.open_table(GATE_APPROVALS).map_err(store_err)?;
            let mut keys = Vec::new();
            for entry in table.range(lo.as_slice()..hi.as_slice()).map_err(store_err)? {
                let (k, _) = entry.map_err(store_err)?;
                keys.push(k.value().to_vec());
            }
            for key in keys {
                table.remove(key.as_slice()).map_err(store_err)?;
            }
            Ok(())
        })
    }

    fn replace_leases(&self, project_id: &str, leases: &[LeaseRecord]) -> Result<()> {
        let encoded: Vec<(String, Vec<u8>)> = leases
            .iter()
            .map(|l| -> Result<(String, Vec<u8>)> { Ok((l.lease_id.clone(), encode(l)?)) })
            .collect::<Result<_>>()?;
        self.write(|wt| {
            let mut table = wt.open_table(LEASES).map_err(store_err)?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (k, v) = entry.map_err(store_err)?;
                let lease: LeaseRecord = decode(v.value())?;
                if lease.project_id == project_id {
                    stale.push(k.value().to_vec());
                }
            }
            for key in stale {
                table.remove(key.as_slice()).map_err(store_err)?;
            }
            for (id, value) in &encoded {
                table
                    .insert(id.as_bytes(), value.as_slice())
                    .map_err(store_err)?;
            }
            Ok(())
        })
    }

    fn active_leases(&self, project_id: &str) -> Result<Vec<LeaseRecord>> {
        let leases: Vec<LeaseRecord> = self.read_all(LEASES)?;
        let mut active: Vec<LeaseRecord> = leases
            .into_iter()
            .filter(|l| l.project_id == project_id && l.status == LeaseStatus::Active)
            .collect();
        active.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(active)
    }

    fn expired_active_leases(&self, now: DateTime<Utc>) -> Result<Vec<LeaseRecord>> {
        let leases: Vec<LeaseRecord> = self.read_all(LEASES)?;
        let mut expired: Vec<LeaseRecord> = leases
            .into_iter()
            .filter(|l| l.status == LeaseStatus::Active && l.expires_at <= now)
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(expired)
    }

    fn set_lease_status(&self, lease_ids: &[String], status: LeaseStatus) -> Result<()> {
        self.write(|wt| {
            let mut table = wt.open_table(LEASES).map_err(store_err)?;
            for id in lease_ids {
                let existing: Option<LeaseRecord> =
                    match table.get(id.as_bytes()).map_err(store_err)? {
                        Some(v) => Some(decode(v.value())?),
                        None => None,
                    };
                if let Some(mut lease) = existing {
                    lease.status = status;
                    let value = encode(&lease)?;
                    table
                        .insert(id.as_bytes(), value.as_slice())
                        .map_err(store_err)?;
                }
            }
            Ok(())
        })
    }

    fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        self.append(AUDIT, event.created_at, event)
    }

    fn list_audit(&self, project_id: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        let events: Vec<AuditEvent> = self.read_all(AUDIT)?;
        Ok(events
            .into_iter()
            .rev()
            .filter(|e| e.project_id == project_id)
            .take(limit)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
