use crate::adapter::{AdapterSet, HostAdapter};
use crate::config::Config;
use crate::error::{truncate_message, AutopilotError, Result};
use crate::plan::PlanTask;
use crate::task::TaskRun;
use crate::types::{Host, TaskRunStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

// ---------------------------------------------------------------------------
// Job and result types
// ---------------------------------------------------------------------------

/// What every task in a phase batch shares.
#[derive(Debug, Clone)]
pub struct PhaseJob {
    pub project_id: String,
    pub workspace_path: PathBuf,
    pub selected_skills: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub task: PlanTask,
    pub host: Host,
    pub status: TaskRunStatus,
    pub output: Value,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl WorkerResult {
    fn completed(task: PlanTask, host: Host, output: Value, started_at: DateTime<Utc>) -> Self {
        Self {
            task,
            host,
            status: TaskRunStatus::Completed,
            output,
            error: None,
            started_at,
        }
    }

    fn failed(task: PlanTask, host: Host, error: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            task,
            host,
            status: TaskRunStatus::Failed,
            output: Value::Null,
            error: Some(truncate_message(error)),
            started_at,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskRunStatus::Failed
    }

    /// Log entry for this result under `run_id`.
    pub fn to_task_run(&self, run_id: &str, project_id: &str) -> TaskRun {
        let entry = match &self.error {
            Some(error) => TaskRun::failed(run_id, project_id, &self.task, error),
            None => TaskRun::completed(run_id, project_id, &self.task, self.output.clone()),
        };
        entry.on_host(self.host).started_at(self.started_at)
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

enum Target {
    Local(Arc<dyn HostAdapter>),
    Remote { client: reqwest::Client, url: String },
}

/// Bounded fan-out of plan tasks onto host adapters or remote workers.
pub struct WorkerPool {
    adapters: AdapterSet,
    role_hosts: BTreeMap<String, Host>,
    max_workers: usize,
    task_timeout: Duration,
    endpoints: Vec<String>,
    client: reqwest::Client,
    host_cursor: AtomicUsize,
    endpoint_cursor: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        adapters: AdapterSet,
        role_hosts: BTreeMap<String, Host>,
        max_workers: usize,
        task_timeout: Duration,
    ) -> Self {
        Self {
            adapters,
            role_hosts,
            max_workers: max_workers.max(1),
            task_timeout,
            endpoints: Vec::new(),
            client: reqwest::Client::new(),
            host_cursor: AtomicUsize::new(0),
            endpoint_cursor: AtomicUsize::new(0),
        }
    }

    /// Send tasks to `endpoints` round-robin instead of the local adapters.
    pub fn with_remote_endpoints(mut self, endpoints: &[String]) -> Result<Self> {
        let mut urls = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            url::Url::parse(endpoint).map_err(|e| {
                AutopilotError::InvalidConfig(format!("remote worker endpoint {endpoint}: {e}"))
            })?;
            urls.push(format!("{}/execute", endpoint.trim_end_matches('/')));
        }
        self.client = reqwest::Client::builder().timeout(self.task_timeout).build()?;
        self.endpoints = urls;
        Ok(self)
    }

    pub fn from_config(config: &Config, adapters: AdapterSet) -> Result<Self> {
        Self::new(
            adapters,
            config.role_hosts(),
            config.worker_pool_size,
            Duration::from_secs(config.task_timeout_secs),
        )
        .with_remote_endpoints(&config.remote_worker_endpoints)
    }

    pub fn is_remote(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// The role's preferred host when it is servable, otherwise the next host
    /// in sorted round-robin order.
    pub fn pick_host(&self, task: &PlanTask) -> Result<Host> {
        let candidates: Vec<Host> = if self.adapters.is_empty() && self.is_remote() {
            Host::all().to_vec()
        } else {
            self.adapters.keys().copied().collect()
        };
        if let Some(host) = self.role_hosts.get(&task.agent) {
            if candidates.contains(host) {
                return Ok(*host);
            }
        }
        if candidates.is_empty() {
            return Err(AutopilotError::InvalidConfig(
                "no host adapters or remote workers configured".to_string(),
            ));
        }
        let i = self.host_cursor.fetch_add(1, Ordering::Relaxed);
        Ok(candidates[i % candidates.len()])
    }

    fn target(&self, host: Host) -> Result<Target> {
        if self.is_remote() {
            let i = self.endpoint_cursor.fetch_add(1, Ordering::Relaxed);
            return Ok(Target::Remote {
                client: self.client.clone(),
                url: self.endpoints[i % self.endpoints.len()].clone(),
            });
        }
        self.adapters
            .get(&host)
            .cloned()
            .map(Target::Local)
            .ok_or_else(|| AutopilotError::UnknownHost(host.to_string()))
    }

    /// Run `tasks` with at most `max_workers` in flight. `on_result` sees each
    /// result as it finishes; the returned list is in plan order.
    pub async fn execute_phase<F>(
        &self,
        job: &PhaseJob,
        tasks: &[PlanTask],
        mut on_result: F,
    ) -> Result<Vec<WorkerResult>>
    where
        F: FnMut(&WorkerResult) -> Result<()>,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let job = Arc::new(job.clone());
        let mut set = JoinSet::new();
        let mut unreported: BTreeMap<String, (PlanTask, Host)> = BTreeMap::new();

        for task in tasks {
            let host = self.pick_host(task)?;
            let target = self.target(host)?;
            unreported.insert(task.task_id.clone(), (task.clone(), host));
            let sem = semaphore.clone();
            let job = job.clone();
            let task = task.clone();
            let timeout = self.task_timeout;
            set.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return WorkerResult::failed(task, host, "semaphore closed", Utc::now())
                    }
                };
                run_one(target, job, task, host, timeout).await
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        let mut join_error = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "worker join failed");
                    join_error = Some(e.to_string());
                    continue;
                }
            };
            unreported.remove(&result.task.task_id);
            if let Some(error) = &result.error {
                tracing::warn!(task_id = %result.task.task_id, host = %result.host, error = %error, "task failed");
            } else {
                tracing::debug!(task_id = %result.task.task_id, host = %result.host, "task completed");
            }
            on_result(&result)?;
            results.push(result);
        }
        for result in lost_results(unreported, join_error.as_deref()) {
            tracing::warn!(task_id = %result.task.task_id, host = %result.host, "task lost its worker");
            on_result(&result)?;
            results.push(result);
        }
        results.sort_by_key(|r| r.task.order_index);
        Ok(results)
    }
}

/// Failed results for tasks whose worker ended without reporting.
fn lost_results(
    unreported: BTreeMap<String, (PlanTask, Host)>,
    join_error: Option<&str>,
) -> Vec<WorkerResult> {
    let reason = format!("worker lost: {}", join_error.unwrap_or("no result reported"));
    unreported
        .into_values()
        .map(|(task, host)| WorkerResult::failed(task, host, &reason, Utc::now()))
        .collect()
}

async fn run_one(
    target: Target,
    job: Arc<PhaseJob>,
    task: PlanTask,
    host: Host,
    timeout: Duration,
) -> WorkerResult {
    let started_at = Utc::now();
    let outcome = match target {
        Target::Local(adapter) => run_local(adapter, job, task.clone(), timeout).await,
        Target::Remote { client, url } => run_remote(&client, &url, &job, &task, host, timeout).await,
    };
    match outcome {
        Ok(output) => WorkerResult::completed(task, host, output, started_at),
        Err(message) => WorkerResult::failed(task, host, &message, started_at),
    }
}

/// The adapter call blocks, so it runs on the blocking pool. A timed-out call
/// is abandoned; its thread finishes on its own.
async fn run_local(
    adapter: Arc<dyn HostAdapter>,
    job: Arc<PhaseJob>,
    task: PlanTask,
    timeout: Duration,
) -> std::result::Result<Value, String> {
    let call = tokio::task::spawn_blocking(move || {
        adapter.execute_task(
            &job.project_id,
            &task,
            &job.workspace_path,
            &job.selected_skills,
        )
    });
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(format!("timed out after {timeout:?}")),
        Ok(Err(join)) => Err(format!("worker panicked: {join}")),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Ok(Ok(output))) => Ok(output),
    }
}

async fn run_remote(
    client: &reqwest::Client,
    url: &str,
    job: &PhaseJob,
    task: &PlanTask,
    host: Host,
    timeout: Duration,
) -> std::result::Result<Value, String> {
    let payload = serde_json::json!({
        "host": host,
        "project_id": job.project_id,
        "workspace_path": job.workspace_path.display().to_string(),
        "task": task,
        "selected_skills": job.selected_skills,
    });
    let request = async {
        let resp = client.post(url).json(&payload).send().await?.error_for_status()?;
        let body: Value = resp.json().await?;
        Ok::<Value, reqwest::Error>(body)
    };
    match tokio::time::timeout(timeout, request).await {
        Err(_) => Err(format!("timed out after {timeout:?}")),
        Ok(Err(e)) => Err(format!("remote worker {url}: {e}")),
        Ok(Ok(output)) => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{adapter_set, MockAdapter};
    use crate::types::Phase;
    use tempfile::TempDir;

    fn task(id: &str, agent: &str, order_index: u32) -> PlanTask {
        PlanTask {
            task_id: id.to_string(),
            title: format!("Task {id}"),
            phase: Phase::Build,
            pod_id: "core".to_string(),
            agent: agent.to_string(),
            skill_id: "core.builder".to_string(),
            instructions: "do it".to_string(),
            acceptance_criteria: vec!["done".to_string()],
            inputs: Vec::new(),
            outputs: Vec::new(),
            guardrails: Vec::new(),
            order_index,
            extensions: BTreeMap::new(),
        }
    }

    fn job() -> PhaseJob {
        PhaseJob {
            project_id: "p1".to_string(),
            workspace_path: PathBuf::from("/tmp/ws"),
            selected_skills: vec!["core.builder".to_string()],
        }
    }

    fn roles() -> BTreeMap<String, Host> {
        BTreeMap::from([("quality".to_string(), Host::CodexDesktop)])
    }

    struct Local {
        _dir: TempDir,
        claude: Arc<MockAdapter>,
        pool: WorkerPool,
    }

    fn local(timeout: Duration) -> Local {
        let dir = TempDir::new().unwrap();
        let claude = Arc::new(MockAdapter::new(Host::ClaudeDesktop, dir.path()));
        let codex = Arc::new(MockAdapter::new(Host::CodexDesktop, dir.path()));
        let adapters = adapter_set([
            claude.clone() as Arc<dyn HostAdapter>,
            codex as Arc<dyn HostAdapter>,
        ]);
        Local {
            _dir: dir,
            claude,
            pool: WorkerPool::new(adapters, roles(), 2, timeout),
        }
    }

    #[test]
    fn role_preference_then_round_robin() {
        let l = local(Duration::from_secs(5));
        assert_eq!(l.pool.pick_host(&task("t1", "quality", 1)).unwrap(), Host::CodexDesktop);
        let picks: Vec<Host> = (0..3)
            .map(|i| l.pool.pick_host(&task("t", "builder", i)).unwrap())
            .collect();
        assert_eq!(
            picks,
            vec![Host::ClaudeDesktop, Host::CodexDesktop, Host::ClaudeDesktop]
        );
    }

    #[test]
    fn no_targets_is_a_config_error() {
        let pool = WorkerPool::new(AdapterSet::new(), roles(), 2, Duration::from_secs(1));
        let err = pool.pick_host(&task("t1", "builder", 1)).unwrap_err();
        assert!(matches!(err, AutopilotError::InvalidConfig(_)));
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let pool = WorkerPool::new(AdapterSet::new(), roles(), 2, Duration::from_secs(1));
        let err = pool
            .with_remote_endpoints(&["not a url".to_string()])
            .err()
            .unwrap();
        assert!(matches!(err, AutopilotError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn phase_results_in_plan_order() {
        let l = local(Duration::from_secs(5));
        l.claude.fail_task("t3");
        let tasks = vec![
            task("t3", "builder", 3),
            task("t1", "quality", 1),
            task("t2", "orchestrator", 2),
        ];
        let mut seen = Vec::new();
        let results = l
            .pool
            .execute_phase(&job(), &tasks, |r| {
                seen.push(r.task.task_id.clone());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(seen.len(), 3);
        let ids: Vec<&str> = results.iter().map(|r| r.task.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert_eq!(results[0].host, Host::CodexDesktop);
        assert_eq!(results[0].output["mode"], "mock");
        // t3 took the first round-robin slot (claude), t2 the second (codex)
        assert_eq!(results[1].host, Host::CodexDesktop);
        assert_eq!(results[1].status, TaskRunStatus::Completed);
        assert_eq!(results[2].host, Host::ClaudeDesktop);
        assert!(results[2].is_failed());
        assert!(results[2]
            .error
            .as_deref()
            .unwrap()
            .contains("mock execution failed"));
    }

    #[tokio::test]
    async fn slow_task_times_out() {
        let l = local(Duration::from_millis(20));
        l.claude.delay_tasks(Duration::from_millis(300));
        let tasks = vec![task("t1", "builder", 1)];
        let results = l.pool.execute_phase(&job(), &tasks, |_| Ok(())).await.unwrap();
        assert_eq!(results[0].host, Host::ClaudeDesktop);
        assert!(results[0].is_failed());
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn callback_error_aborts_collection() {
        let l = local(Duration::from_secs(5));
        let tasks = vec![task("t1", "builder", 1)];
        let err = l
            .pool
            .execute_phase(&job(), &tasks, |_| Err(AutopilotError::Store("down".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, AutopilotError::Store(_)));
    }

    #[test]
    fn failed_result_becomes_failed_log_entry() {
        let r = WorkerResult::failed(task("t1", "builder", 1), Host::CodexDesktop, "boom", Utc::now());
        let entry = r.to_task_run("run-1", "p1");
        assert_eq!(entry.status, TaskRunStatus::Failed);
        assert_eq!(entry.host, Some(Host::CodexDesktop));
        assert_eq!(entry.error.as_deref(), Some("boom"));
        assert_eq!(entry.order_index, 1);
    }

    #[test]
    fn lost_worker_becomes_failed_result() {
        let mut unreported = BTreeMap::new();
        unreported.insert("t2".to_string(), (task("t2", "builder", 2), Host::ClaudeDesktop));
        let results = lost_results(unreported, Some("task 7 panicked"));
        assert_eq!(results.len(), 1);
        assert!(results[0].is_failed());
        assert_eq!(results[0].task.task_id, "t2");
        assert_eq!(results[0].error.as_deref(), Some("worker lost: task 7 panicked"));

        assert!(lost_results(BTreeMap::new(), None).is_empty());
    }

    #[tokio::test]
    async fn remote_workers_receive_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/execute")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "project_id": "p1",
                "selected_skills": ["core.builder"],
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result":"remote ok"}"#)
            .expect(2)
            .create_async()
            .await;

        let endpoint = format!("{}/", server.url());
        let pool = WorkerPool::new(AdapterSet::new(), roles(), 2, Duration::from_secs(5))
            .with_remote_endpoints(&[endpoint])
            .unwrap();
        let tasks = vec![task("t1", "quality", 1), task("t2", "builder", 2)];
        let results = pool.execute_phase(&job(), &tasks, |_| Ok(())).await.unwrap();

        assert!(results.iter().all(|r| r.status == TaskRunStatus::Completed));
        assert_eq!(results[0].host, Host::CodexDesktop);
        assert_eq!(results[1].output["result"], "remote ok");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn remote_error_status_fails_task() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/execute")
            .with_status(500)
            .create_async()
            .await;

        let pool = WorkerPool::new(AdapterSet::new(), roles(), 1, Duration::from_secs(5))
            .with_remote_endpoints(&[server.url()])
            .unwrap();
        let results = pool
            .execute_phase(&job(), &[task("t1", "builder", 1)], |_| Ok(()))
            .await
            .unwrap();
        assert!(results[0].is_failed());
        assert!(results[0].error.as_deref().unwrap().contains("remote worker"));
    }
}
