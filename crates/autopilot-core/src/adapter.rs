use crate::error::{AutopilotError, Result};
use crate::io::{atomic_write, read_optional};
use crate::plan::PlanTask;
use crate::types::Host;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// HostAdapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterResult {
    pub host: Host,
    pub success: bool,
    pub message: String,
}

impl AdapterResult {
    pub fn ok(host: Host, message: impl Into<String>) -> Self {
        Self {
            host,
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(host: Host, message: impl Into<String>) -> Self {
        Self {
            host,
            success: false,
            message: message.into(),
        }
    }
}

/// Agent host integration. Calls are synchronous and may block; the worker
/// pool runs `execute_task` off the async runtime.
pub trait HostAdapter: Send + Sync {
    fn host(&self) -> Host;

    /// Activation failures are reported, not raised.
    fn activate(&self, project_id: &str, skill_ids: &[String]) -> AdapterResult;

    fn deactivate(&self, project_id: &str, skill_ids: &[String]) -> AdapterResult;

    fn execute_task(
        &self,
        project_id: &str,
        task: &PlanTask,
        workspace_path: &Path,
        selected_skills: &[String],
    ) -> Result<serde_json::Value>;
}

/// Adapters keyed by the host they serve.
pub type AdapterSet = BTreeMap<Host, Arc<dyn HostAdapter>>;

pub fn adapter_set(adapters: impl IntoIterator<Item = Arc<dyn HostAdapter>>) -> AdapterSet {
    adapters.into_iter().map(|a| (a.host(), a)).collect()
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Script {
    fail_activate: bool,
    fail_deactivate: bool,
    fail_tasks: BTreeSet<String>,
    task_delay: Option<Duration>,
}

/// Local stand-in for a desktop host. Active skills are kept as
/// `project_id:skill_id` lines in `<state_dir>/<host>_active_skills.txt`.
#[derive(Debug)]
pub struct MockAdapter {
    host: Host,
    state_file: PathBuf,
    script: Mutex<Script>,
    /// Serializes read-modify-write of `state_file`.
    file_lock: Mutex<()>,
}

impl MockAdapter {
    pub fn new(host: Host, state_dir: &Path) -> Self {
        Self {
            host,
            state_file: state_dir.join(format!("{host}_active_skills.txt")),
            script: Mutex::new(Script::default()),
            file_lock: Mutex::new(()),
        }
    }

    pub fn fail_activate(&self, fail: bool) {
        if let Ok(mut s) = self.script.lock() {
            s.fail_activate = fail;
        }
    }

    pub fn fail_deactivate(&self, fail: bool) {
        if let Ok(mut s) = self.script.lock() {
            s.fail_deactivate = fail;
        }
    }

    /// `execute_task` errors for this task id from now on.
    pub fn fail_task(&self, task_id: &str) {
        if let Ok(mut s) = self.script.lock() {
            s.fail_tasks.insert(task_id.to_string());
        }
    }

    /// Sleep before each execution; used to exercise timeouts.
    pub fn delay_tasks(&self, delay: Duration) {
        if let Ok(mut s) = self.script.lock() {
            s.task_delay = Some(delay);
        }
    }

    /// Lines currently recorded as active.
    pub fn active_entries(&self) -> Result<Vec<String>> {
        let text = read_optional(&self.state_file)?.unwrap_or_default();
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn write_entries(&self, entries: &BTreeSet<String>) -> Result<()> {
        let body = entries.iter().cloned().collect::<Vec<_>>().join("\n");
        atomic_write(&self.state_file, body.as_bytes())
    }

    fn scripted<T>(&self, f: impl FnOnce(&Script) -> T) -> T {
        match self.script.lock() {
            Ok(s) => f(&*s),
            Err(poisoned) => f(&*poisoned.into_inner()),
        }
    }
}

impl HostAdapter for MockAdapter {
    fn host(&self) -> Host {
        self.host
    }

    fn activate(&self, project_id: &str, skill_ids: &[String]) -> AdapterResult {
        if self.scripted(|s| s.fail_activate) {
            return AdapterResult::failed(self.host, "activation refused");
        }
        let _guard = self.file_lock.lock();
        let result = self.active_entries().and_then(|existing| {
            let mut entries: BTreeSet<String> = existing.into_iter().collect();
            entries.extend(skill_ids.iter().map(|s| format!("{project_id}:{s}")));
            self.write_entries(&entries)
        });
        match result {
            Ok(()) => AdapterResult::ok(self.host, format!("Activated {} skills", skill_ids.len())),
            Err(e) => AdapterResult::failed(self.host, e.to_string()),
        }
    }

    fn deactivate(&self, project_id: &str, skill_ids: &[String]) -> AdapterResult {
        if self.scripted(|s| s.fail_deactivate) {
            return AdapterResult::failed(self.host, "deactivation refused");
        }
        let block: BTreeSet<String> = skill_ids
            .iter()
            .map(|s| format!("{project_id}:{s}"))
            .collect();
        let _guard = self.file_lock.lock();
        let result = self.active_entries().and_then(|existing| {
            let remaining: BTreeSet<String> =
                existing.into_iter().filter(|l| !block.contains(l)).collect();
            self.write_entries(&remaining)
        });
        match result {
            Ok(()) => AdapterResult::ok(
                self.host,
                format!("Deactivated {} skills", skill_ids.len()),
            ),
            Err(e) => AdapterResult::failed(self.host, e.to_string()),
        }
    }

    fn execute_task(
        &self,
        project_id: &str,
        task: &PlanTask,
        workspace_path: &Path,
        selected_skills: &[String],
    ) -> Result<serde_json::Value> {
        let (fails, delay) =
            self.scripted(|s| (s.fail_tasks.contains(&task.task_id), s.task_delay));
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if fails {
            return Err(AutopilotError::Execution {
                task_id: task.task_id.clone(),
                host: self.host.to_string(),
                message: "mock execution failed".to_string(),
            });
        }
        Ok(serde_json::json!({
            "project_id": project_id,
            "host": self.host,
            "mode": "mock",
            "title": task.title,
            "workspace_path": workspace_path.display().to_string(),
            "selected_skill_count": selected_skills.len(),
            "result": format!("Mock execution completed for: {}", task.title),
        }))
    }
}
