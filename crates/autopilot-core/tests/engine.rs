use std::sync::Arc;

use autopilot_core::adapter::{adapter_set, HostAdapter, MockAdapter};
use autopilot_core::catalog::CatalogSource;
use autopilot_core::engine::RerouteOutcome;
use autopilot_core::gate::{DISCOVERY_GATE, QUALITY_GATE, SYSTEM_APPROVER};
use autopilot_core::lease::CloseStatus;
use autopilot_core::types::{EndReason, Host, Phase, ProjectState, RunStatus};
use autopilot_core::{AutopilotError, Config, Engine, MemoryStore, NextTask, RedbStore, Store};
use chrono::{Duration, Utc};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BRIEF: &str = "# Goals\n\
- Build a patient booking portal for a network of dental clinics.\n\
- Reduce no-show rates with reminder messages.\n\
# Constraints\n\
- Must comply with HIPAA privacy requirements.\n\
# Deliverables\n\
- Booking web app\n\
- Reminder service\n";

const NEW_BRIEF: &str = "# Goals\n\
- Launch a pricing experiment for a subscription analytics product.\n\
- Compare annual and monthly plans across three markets.\n\
# Deliverables\n\
- Pricing page variants\n\
- Experiment readout\n";

struct Harness {
    dir: TempDir,
    engine: Engine,
    store: Arc<dyn Store>,
    claude: Arc<MockAdapter>,
    codex: Arc<MockAdapter>,
}

impl Harness {
    fn workspace(&self) -> std::path::PathBuf {
        self.dir.path().join("workspace")
    }

    fn brief_path(&self) -> String {
        self.workspace()
            .join("project_brief.md")
            .to_string_lossy()
            .into_owned()
    }

    fn write_brief(&self, text: &str) {
        std::fs::write(self.workspace().join("project_brief.md"), text).unwrap();
    }

    fn start(&self) -> String {
        self.engine
            .start_project(&self.workspace(), &self.brief_path(), Host::all())
            .unwrap()
            .project_id
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn write_skill(root: &std::path::Path, rel: &str, text: &str) {
    let dir = root.join(rel);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("SKILL.md"), text).unwrap();
}

fn harness_with(store: Arc<dyn Store>, dir: TempDir, mut config: Config) -> Harness {
    init_tracing();
    let catalog = dir.path().join("catalog");
    write_skill(
        &catalog,
        "health/booking",
        "---\ndescription: Patient appointment booking and scheduling workflows\ntags: [booking, patient, scheduling, clinic]\n---\n# Clinic Booking\n",
    );
    write_skill(
        &catalog,
        "growth/pricing",
        "---\ndescription: Pricing experiments for subscription plans and markets\ntags: [pricing, subscription, experiment, plans]\n---\n# Pricing Lab\n",
    );
    config.catalogs = vec![CatalogSource::new("local_library", &catalog)];

    std::fs::create_dir_all(dir.path().join("workspace")).unwrap();
    let claude = Arc::new(MockAdapter::new(Host::ClaudeDesktop, dir.path()));
    let codex = Arc::new(MockAdapter::new(Host::CodexDesktop, dir.path()));
    let adapters = adapter_set([
        claude.clone() as Arc<dyn HostAdapter>,
        codex.clone() as Arc<dyn HostAdapter>,
    ]);
    let engine = Engine::with_parts(config, store.clone(), adapters).unwrap();
    let h = Harness {
        dir,
        engine,
        store,
        claude,
        codex,
    };
    h.write_brief(BRIEF);
    h
}

fn harness() -> Harness {
    harness_with(
        Arc::new(MemoryStore::new()),
        TempDir::new().unwrap(),
        Config::default(),
    )
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn start_project_persists_route_plan_and_leases() {
    let h = harness();
    let outcome = h
        .engine
        .start_project(&h.workspace(), &h.brief_path(), Host::all())
        .unwrap();
    let pid = &outcome.project_id;

    let project = h.store.get_project(pid).unwrap().unwrap();
    assert_eq!(project.state, ProjectState::Active);
    assert_eq!(project.host_targets, Host::all().to_vec());

    let plan = h.store.latest_plan(pid).unwrap().unwrap();
    assert_eq!(plan.plan_id, outcome.plan_id);
    assert_eq!(plan.route_id, outcome.route.route_id);

    let selected = outcome.route.selected_skills.len();
    assert!(selected > 0);
    assert_eq!(h.store.active_skill_count(pid).unwrap(), selected);
    assert_eq!(h.store.active_hosts(pid).unwrap(), Host::all().to_vec());
    assert_eq!(h.claude.active_entries().unwrap().len(), selected);
    assert_eq!(h.codex.active_entries().unwrap().len(), selected);

    let audit = h.engine.audit(pid, 10).unwrap();
    let start = audit.iter().find(|e| e.event_type == "project.start").unwrap();
    assert_eq!(start.route_id.as_deref(), Some(outcome.route.route_id.as_str()));
    assert_eq!(start.payload["selected_skill_count"], selected);
}

#[test]
fn start_rejects_short_brief_and_unknown_path() {
    let h = harness();
    h.write_brief("too short");
    let err = h
        .engine
        .start_project(&h.workspace(), &h.brief_path(), Host::all())
        .unwrap_err();
    assert!(matches!(err, AutopilotError::BriefTooShort { .. }));
    assert!(err.is_validation());

    let missing = h.dir.path().join("nowhere/brief.md");
    let err = h
        .engine
        .start_project(&h.workspace(), &missing.to_string_lossy(), Host::all())
        .unwrap_err();
    assert!(matches!(err, AutopilotError::BriefUnreadable { .. }));
    assert!(h.engine.history().unwrap().is_empty());
}

#[test]
fn brief_directory_and_file_uri_resolve() {
    let h = harness();
    let ws = h.workspace();
    let by_dir = h
        .engine
        .start_project(&ws, &ws.to_string_lossy(), &[Host::ClaudeDesktop])
        .unwrap();
    let uri = url::Url::from_file_path(ws.join("project_brief.md")).unwrap();
    let by_uri = h
        .engine
        .start_project(&ws, &format!("\"{uri}\""), &[Host::ClaudeDesktop])
        .unwrap();
    assert_eq!(by_dir.route.plan_hash, by_uri.route.plan_hash);
}

#[test]
fn routing_is_deterministic_across_projects() {
    let h = harness();
    let a = h
        .engine
        .start_project(&h.workspace(), &h.brief_path(), Host::all())
        .unwrap();
    let b = h
        .engine
        .start_project(&h.workspace(), &h.brief_path(), Host::all())
        .unwrap();
    assert_ne!(a.project_id, b.project_id);
    assert_eq!(a.route.plan_hash, b.route.plan_hash);
    assert_eq!(a.route.selected_skills, b.route.selected_skills);
}

#[test]
fn end_project_closes_and_terminates_run() {
    let h = harness();
    let pid = h.start();
    h.engine.start_run(&pid).unwrap();

    let outcome = h.engine.end_project(&pid, EndReason::Completed).unwrap();
    assert_eq!(outcome.status, CloseStatus::Closed);
    assert!(outcome.failed_hosts.is_empty());

    let status = h.engine.project_status(&pid).unwrap();
    assert_eq!(status.state, ProjectState::Closed);
    assert_eq!(status.active_skill_count, 0);
    assert!(h.claude.active_entries().unwrap().is_empty());

    let run = h.store.latest_run(&pid).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Terminated);
    assert!(h.store.get_project(&pid).unwrap().unwrap().ended_at.is_some());
}

#[test]
fn partial_close_names_failed_host() {
    let h = harness();
    let pid = h.start();
    h.codex.fail_deactivate(true);

    let outcome = h.engine.end_project(&pid, EndReason::Cancelled).unwrap();
    assert_eq!(outcome.status, CloseStatus::PartialClose);
    assert_eq!(outcome.failed_hosts, vec![Host::CodexDesktop]);
    assert_eq!(
        h.engine.project_status(&pid).unwrap().active_hosts,
        vec![Host::CodexDesktop]
    );
}

#[test]
fn unknown_project_is_not_found() {
    let h = harness();
    assert!(h.engine.project_status("ghost").unwrap_err().is_not_found());
    assert!(h
        .engine
        .end_project("ghost", EndReason::Completed)
        .unwrap_err()
        .is_not_found());
    assert_eq!(h.engine.next_task("ghost").unwrap(), NextTask::NoPlan);
}

// ---------------------------------------------------------------------------
// Reroute
// ---------------------------------------------------------------------------

#[test]
fn unchanged_brief_skips_reroute() {
    let h = harness();
    let pid = h.start();
    assert_eq!(
        h.engine.reroute_if_material_change(&pid).unwrap(),
        RerouteOutcome::Skipped
    );
    assert_eq!(h.store.list_routes(&pid).unwrap().len(), 1);
    let audit = h.engine.audit(&pid, 1).unwrap();
    assert_eq!(audit[0].event_type, "project.reroute.skipped");
}

#[test]
fn material_change_reroutes_and_resets_gates() {
    let h = harness();
    let pid = h.start();
    let first_plan = h.store.latest_plan(&pid).unwrap().unwrap().plan_id;
    h.engine.start_run(&pid).unwrap();
    h.engine
        .approve_gate(&pid, DISCOVERY_GATE, "lead", "looks fine")
        .unwrap();

    h.write_brief(NEW_BRIEF);
    let outcome = h.engine.reroute_if_material_change(&pid).unwrap();
    let RerouteOutcome::Applied { plan_id, .. } = &outcome else {
        panic!("expected reroute, got {outcome:?}");
    };
    assert_ne!(*plan_id, first_plan);
    assert_eq!(h.store.list_routes(&pid).unwrap().len(), 2);
    assert!(h.store.list_gate_approvals(&pid).unwrap().is_empty());
    assert_eq!(
        h.store.latest_run(&pid).unwrap().unwrap().status,
        RunStatus::Terminated
    );

    // the next run walks the new plan from its first task
    h.engine.start_run(&pid).unwrap();
    let next = h.engine.next_task(&pid).unwrap();
    let new_plan = h.store.latest_plan(&pid).unwrap().unwrap().plan;
    assert_eq!(
        next.task().unwrap().task_id,
        new_plan.tasks().next().unwrap().task_id
    );
}

#[test]
fn closed_project_is_not_rerouted() {
    let h = harness();
    let pid = h.start();
    h.engine.end_project(&pid, EndReason::Paused).unwrap();
    h.write_brief(NEW_BRIEF);
    assert_eq!(
        h.engine.reroute_if_material_change(&pid).unwrap(),
        RerouteOutcome::Inactive {
            state: ProjectState::Closed
        }
    );
}

// ---------------------------------------------------------------------------
// Task flow
// ---------------------------------------------------------------------------

#[test]
fn manual_task_flow_with_gate() {
    let h = harness();
    let pid = h.start();
    h.engine.start_run(&pid).unwrap();
    let plan = h.store.latest_plan(&pid).unwrap().unwrap().plan;

    let discovery = plan.phase_tasks(Phase::Discovery);
    for (i, task) in discovery.iter().enumerate() {
        let next = h.engine.next_task(&pid).unwrap();
        assert_eq!(next.task().unwrap().task_id, task.task_id);
        if i == 0 {
            h.engine.skip_task(&pid, &task.task_id, "already known").unwrap();
        } else {
            h.engine
                .complete_task(&pid, &task.task_id, "done", &["notes.md".to_string()], serde_json::json!({"ok": true}))
                .unwrap();
        }
    }

    let approval = h.store.gate_approval(&pid, DISCOVERY_GATE).unwrap().unwrap();
    assert_eq!(approval.approved_by, SYSTEM_APPROVER);

    let build_first = &plan.phase_tasks(Phase::Build)[0];
    let outcome = h
        .engine
        .fail_task(&pid, &build_first.task_id, "compiler exploded")
        .unwrap();
    assert_eq!(outcome.next.task().unwrap().task_id, build_first.task_id);

    let checklist = h.engine.checklist(&pid).unwrap();
    assert!(checklist.text.starts_with(&format!(
        "# Task Progress: {}/{} complete",
        discovery.len(),
        plan.total_tasks()
    )));
    assert!(checklist.text.contains("[~]"));
    assert!(checklist.text.contains("[!]"));

    let status = h.engine.task_status(&pid).unwrap();
    assert_eq!(status.status(), "running");
    assert_eq!(status.tasks.len(), discovery.len() + 1);
}

#[test]
fn concurrent_completions_keep_run_counters() {
    let h = harness();
    let pid = h.start();
    h.engine.start_run(&pid).unwrap();
    let plan = h.store.latest_plan(&pid).unwrap().unwrap().plan;
    let ids: Vec<String> = plan.tasks().map(|t| t.task_id.clone()).collect();

    std::thread::scope(|s| {
        for offset in 0..2 {
            let (engine, pid, ids) = (&h.engine, &pid, &ids);
            s.spawn(move || {
                for id in ids.iter().skip(offset).step_by(2) {
                    engine
                        .complete_task(pid, id, "done", &[], serde_json::json!({}))
                        .unwrap();
                }
            });
        }
    });

    let run = h.store.latest_run(&pid).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.executed, plan.total_tasks());
    assert!(run.pending_gates.is_empty());
    assert_eq!(
        h.store.list_task_runs(&run.run_id).unwrap().len(),
        plan.total_tasks()
    );
}

#[test]
fn approving_unknown_gate_fails() {
    let h = harness();
    let pid = h.start();
    let err = h
        .engine
        .approve_gate(&pid, "gate-9", "lead", "")
        .unwrap_err();
    assert!(matches!(err, AutopilotError::GateNotFound(_)));
}

#[tokio::test]
async fn run_project_end_to_end() {
    let h = harness();
    let pid = h.start();

    let outcome = h.engine.run_project(&pid, Some(true)).await.unwrap();
    assert_eq!(outcome.run.status, RunStatus::Completed);
    let plan = h.store.latest_plan(&pid).unwrap().unwrap().plan;
    assert_eq!(outcome.run.executed, plan.total_tasks());
    assert!(h.store.is_gate_approved(&pid, QUALITY_GATE).unwrap());

    let log = h.store.list_task_runs(&outcome.run.run_id).unwrap();
    let seqs: Vec<u32> = log.iter().map(|t| t.seq).collect();
    assert_eq!(seqs, (1..=log.len() as u32).collect::<Vec<_>>());
    assert!(h.engine.next_task(&pid).unwrap().is_all_complete());
}

#[tokio::test]
async fn ending_a_running_project_terminates_its_run() {
    let h = harness();
    let pid = h.start();
    h.claude.delay_tasks(std::time::Duration::from_millis(150));
    h.codex.delay_tasks(std::time::Duration::from_millis(150));

    let end = async {
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        h.engine.end_project(&pid, EndReason::Cancelled).unwrap()
    };
    let (outcome, closed) = tokio::join!(h.engine.run_project(&pid, Some(true)), end);
    let outcome = outcome.unwrap();

    assert_eq!(closed.status, CloseStatus::Closed);
    assert_eq!(outcome.run.status, RunStatus::Terminated);
    let plan = h.store.latest_plan(&pid).unwrap().unwrap().plan;
    assert_eq!(outcome.dispatched, plan.phase_tasks(Phase::Discovery).len());

    let stored = h.store.latest_run(&pid).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Terminated);
    let project = h.store.get_project(&pid).unwrap().unwrap();
    assert_eq!(project.state, ProjectState::Closed);
}

#[tokio::test]
async fn run_project_waits_on_manual_gate() {
    let mut config = Config::default();
    config.auto_approve_gates = false;
    let h = harness_with(Arc::new(MemoryStore::new()), TempDir::new().unwrap(), config);
    let pid = h.start();

    let outcome = h.engine.run_project(&pid, None).await.unwrap();
    assert_eq!(outcome.run.status, RunStatus::Blocked);
    assert_eq!(outcome.run.pending_gates, vec![DISCOVERY_GATE.to_string()]);
    match h.engine.next_task(&pid).unwrap() {
        NextTask::Blocked { gate_id, criteria, .. } => {
            assert_eq!(gate_id, DISCOVERY_GATE);
            assert!(!criteria.is_empty());
        }
        other => panic!("expected blocked, got {other:?}"),
    }
}

#[tokio::test]
async fn closed_project_cannot_run() {
    let h = harness();
    let pid = h.start();
    h.engine.end_project(&pid, EndReason::Completed).unwrap();
    let err = h.engine.run_project(&pid, Some(true)).await.unwrap_err();
    assert!(matches!(err, AutopilotError::ProjectNotExecutable { .. }));
}

// ---------------------------------------------------------------------------
// Leases and persistence
// ---------------------------------------------------------------------------

#[test]
fn sweep_closes_expired_projects() {
    let mut config = Config::default();
    config.policy.lease_ttl_hours = 1;
    let h = harness_with(Arc::new(MemoryStore::new()), TempDir::new().unwrap(), config);
    let pid = h.start();

    assert!(h.engine.sweep_expired(Utc::now()).unwrap().is_empty());
    let ended = h.engine.sweep_expired(Utc::now() + Duration::hours(2)).unwrap();
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].project_id, pid);
    assert_eq!(
        h.engine.project_status(&pid).unwrap().state,
        ProjectState::Closed
    );
    let close = h
        .engine
        .audit(&pid, 20)
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == "project.close")
        .unwrap();
    assert_eq!(close.payload["reason"], "ttl_expiry");
}

#[test]
fn history_lists_newest_first() {
    let h = harness();
    let first = h.start();
    let second = h.start();
    let history = h.engine.history().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].project_id, second);
    assert_eq!(history[1].project_id, first);
    assert!(history[0].selected_skill_count > 0);
}

#[test]
fn progress_survives_reopening_the_database() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("state/autopilot.redb");
    let store: Arc<dyn Store> = Arc::new(RedbStore::open(&db_path).unwrap());
    let h = harness_with(store, dir, Config::default());
    let pid = h.start();
    h.engine.start_run(&pid).unwrap();
    let first = h.engine.next_task(&pid).unwrap().task().unwrap().task_id.clone();
    h.engine
        .complete_task(&pid, &first, "done", &[], serde_json::Value::Null)
        .unwrap();

    // release the database but keep the temp dir
    let Harness {
        dir: _dir,
        engine,
        store,
        ..
    } = h;
    drop(engine);
    drop(store);

    let store = RedbStore::open(&db_path).unwrap();
    let run = store.latest_run(&pid).unwrap().unwrap();
    let log = store.list_task_runs(&run.run_id).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].task_id, first);

    let machine = autopilot_core::TaskStateMachine::new(&store);
    let next = machine.next_task(&pid).unwrap();
    assert_ne!(next.task().unwrap().task_id, first);
}
