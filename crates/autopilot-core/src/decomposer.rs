//! Route → phased [`Plan`].
//!
//! Four phases in fixed order. Core-role tasks are always present; kernels,
//! attached pods, and routed skills add tasks around them. Outputs of one
//! phase are named as inputs of the next, and `order_index` counts from 1
//! across the whole plan.

use crate::gate::standard_gates;
use crate::intent::Intent;
use crate::plan::{KernelRef, Plan, PlanPhase, PlanSummary, PlanTask, PodAssignment};
use crate::pods::{self, KernelSpec, PodSpec};
use crate::router::SkillReason;
use crate::types::Phase;
use std::collections::BTreeMap;

pub const GUARDRAILS: [&str; 4] = [
    "Do not invent facts or metrics.",
    "State assumptions and confidence clearly.",
    "Prefer the smallest viable scope that meets the objective.",
    "Save output files to the workspace root unless the task needs a directory layout.",
];

/// Pods whose tasks are already covered by the core phase skeleton.
const SKELETON_PODS: [&str; 2] = ["core", "discovery"];

struct Draft<'a> {
    task_id: String,
    title: String,
    pod_id: String,
    agent: &'a str,
    skill_id: String,
    instructions: String,
    acceptance: Vec<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Draft<'_> {
    fn into_task(self, phase: Phase) -> PlanTask {
        PlanTask {
            task_id: self.task_id,
            title: self.title,
            phase,
            pod_id: self.pod_id,
            agent: self.agent.to_string(),
            skill_id: self.skill_id,
            instructions: self.instructions,
            acceptance_criteria: self.acceptance,
            inputs: self.inputs,
            outputs: self.outputs,
            guardrails: strings(&GUARDRAILS),
            order_index: 0,
            extensions: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

fn discovery_tasks(
    pods: &BTreeMap<&'static str, &'static PodSpec>,
    kernels: &[&KernelSpec],
) -> Vec<PlanTask> {
    let mut tasks = vec![
        Draft {
            task_id: "discovery-scope".into(),
            title: "Scope the project: goals, constraints, and acceptance criteria".into(),
            pod_id: "core".into(),
            agent: "orchestrator",
            skill_id: "core.orchestrator".into(),
            instructions: "Read the brief and write down what is in and out of scope, the success \
                           criteria, the hard constraints, and the known risks."
                .into(),
            acceptance: strings(&[
                "Goals are specific and measurable",
                "Constraints are listed with their source",
                "Every deliverable has acceptance criteria",
            ]),
            inputs: strings(&["project_brief.md"]),
            outputs: strings(&["scope_document.md"]),
        },
        Draft {
            task_id: "discovery-research".into(),
            title: "Research context: facts, options, and open questions".into(),
            pod_id: "core".into(),
            agent: "research",
            skill_id: "core.research".into(),
            instructions: "Collect the background the project depends on. Compare candidate \
                           approaches and keep facts apart from assumptions."
                .into(),
            acceptance: strings(&[
                "Key facts cite a source",
                "Assumptions are listed explicitly",
                "Open questions are flagged",
            ]),
            inputs: strings(&["project_brief.md", "scope_document.md"]),
            outputs: strings(&["research_briefing.md"]),
        },
    ];

    if pods.contains_key("discovery") {
        tasks.push(Draft {
            task_id: "discovery-requirements".into(),
            title: "Turn goals into testable requirements".into(),
            pod_id: "discovery".into(),
            agent: "requirements_specifier",
            skill_id: "discovery.requirements_specifier".into(),
            instructions: "Break each goal into requirements that can be checked, and name the \
                           evidence that proves each one."
                .into(),
            acceptance: strings(&[
                "Each requirement traces to a goal",
                "Each requirement has acceptance criteria",
            ]),
            inputs: strings(&["scope_document.md", "research_briefing.md"]),
            outputs: strings(&["requirements.md"]),
        });
    }

    for kernel in kernels {
        tasks.push(Draft {
            task_id: format!("discovery-kernel-{}", kernel.kernel_id),
            title: format!("Assess readiness for {}", kernel.name),
            pod_id: format!("kernel.{}", kernel.kernel_id),
            agent: "kernel_assessor",
            skill_id: format!("kernel.{}", kernel.kernel_id),
            instructions: format!(
                "Decide how {} work will be delivered ({}). Identify the domain standards, \
                 required artifacts, evidence rules, and key decision points.",
                kernel.name, kernel.description
            ),
            acceptance: vec![
                format!("{} approach defined", kernel.name),
                "Domain standards identified".into(),
                "Decision points documented".into(),
            ],
            inputs: strings(&["scope_document.md", "requirements.md"]),
            outputs: vec![format!("{}_approach.md", kernel.kernel_id)],
        });
    }

    tasks.into_iter().map(|d| d.into_task(Phase::Discovery)).collect()
}

fn build_tasks(kernels: &[&KernelSpec], selected: &[SkillReason]) -> Vec<PlanTask> {
    let mut tasks = vec![Draft {
        task_id: "build-plan".into(),
        title: "Write the execution plan and task graph".into(),
        pod_id: "core".into(),
        agent: "orchestrator",
        skill_id: "core.orchestrator".into(),
        instructions: "From the discovery outputs, lay out the task graph with owners, \
                       dependencies, and the critical path. This is the only planning task in \
                       the build phase; every later build task produces working artifacts."
            .into(),
        acceptance: strings(&[
            "Dependencies between tasks are explicit",
            "Every task has an owning skill or agent",
            "Critical path identified",
        ]),
        inputs: strings(&["scope_document.md", "requirements.md"]),
        outputs: strings(&["execution_plan.md"]),
    }];

    for kernel in kernels {
        tasks.push(Draft {
            task_id: format!("build-kernel-{}", kernel.kernel_id),
            title: format!("Produce the {} deliverables", kernel.name),
            pod_id: format!("kernel.{}", kernel.kernel_id),
            agent: "builder",
            skill_id: format!("kernel.{}", kernel.kernel_id),
            instructions: format!(
                "Build the concrete artifacts the execution plan calls for ({}). Write the \
                 real files into the workspace rather than describing them.",
                kernel.description
            ),
            acceptance: strings(&[
                "Deliverables match the execution plan",
                "Changes are traceable",
                "Verification evidence collected",
            ]),
            inputs: vec![
                "execution_plan.md".into(),
                format!("{}_approach.md", kernel.kernel_id),
            ],
            outputs: vec![format!("{}_deliverables/", kernel.kernel_id)],
        });
    }

    for skill in selected {
        let sid = skill.skill_id.as_str();
        if sid.starts_with("core.") || sid.starts_with("kernel.") {
            continue;
        }
        let (pod_id, agent) = match sid.split_once('.') {
            Some((cluster, _)) => (cluster.to_string(), sid.rsplit('.').next().unwrap_or(sid)),
            None => ("build".to_string(), sid),
        };
        tasks.push(Draft {
            task_id: format!("build-skill-{sid}"),
            title: format!("Apply {sid}: {}", skill.reason),
            pod_id,
            agent,
            skill_id: sid.to_string(),
            instructions: format!(
                "Use {sid} to produce its part of the deliverables ({}). Save working files \
                 next to the other project outputs.",
                skill.reason
            ),
            acceptance: strings(&["Output serves the project goals"]),
            inputs: strings(&["execution_plan.md"]),
            outputs: vec![format!("{sid}_output.md")],
        });
    }

    tasks.push(Draft {
        task_id: "build-document".into(),
        title: "Record build progress and decisions".into(),
        pod_id: "core".into(),
        agent: "scribe",
        skill_id: "core.scribe".into(),
        instructions: "Keep the decision log and changelog current through the build, and \
                       summarize progress for stakeholders."
            .into(),
        acceptance: strings(&[
            "Major decisions recorded with rationale",
            "Changelog is current",
        ]),
        inputs: strings(&["execution_plan.md"]),
        outputs: strings(&["build_summary.md", "decision_log.md"]),
    });

    tasks.into_iter().map(|d| d.into_task(Phase::Build)).collect()
}

fn verify_tasks(
    pods: &BTreeMap<&'static str, &'static PodSpec>,
    kernels: &[&KernelSpec],
) -> Vec<PlanTask> {
    let mut tasks = vec![Draft {
        task_id: "verify-quality".into(),
        title: "Check every deliverable against its acceptance criteria".into(),
        pod_id: "core".into(),
        agent: "quality",
        skill_id: "core.quality".into(),
        instructions: "Open and exercise each produced file, run whatever tests or linters \
                       exist, and report pass or fail per deliverable."
            .into(),
        acceptance: strings(&[
            "Every deliverable reviewed",
            "Gaps and risks documented",
            "Quality report produced",
        ]),
        inputs: strings(&["requirements.md", "build_summary.md"]),
        outputs: strings(&["quality_report.md"]),
    }];

    for kernel in kernels {
        tasks.push(Draft {
            task_id: format!("verify-kernel-{}", kernel.kernel_id),
            title: format!("Domain validation for {}", kernel.name),
            pod_id: format!("kernel.{}", kernel.kernel_id),
            agent: "verifier",
            skill_id: format!("kernel.{}", kernel.kernel_id),
            instructions: format!(
                "Validate the {} deliverables against the domain standards and evidence \
                 rules ({}).",
                kernel.name, kernel.description
            ),
            acceptance: vec![
                format!("{} standards compliance verified", kernel.name),
                "Readiness gates satisfied".into(),
                "Evidence is traceable".into(),
            ],
            inputs: vec![
                format!("{}_deliverables/", kernel.kernel_id),
                "quality_report.md".into(),
            ],
            outputs: vec![format!("{}_verification.md", kernel.kernel_id)],
        });
    }

    for (pod_id, pod) in pods {
        if SKELETON_PODS.contains(pod_id) {
            continue;
        }
        let lead = pod.agents.first().copied().unwrap_or("reviewer");
        tasks.push(Draft {
            task_id: format!("verify-pod-{pod_id}"),
            title: format!("{} review of the deliverables", pod.name),
            pod_id: pod_id.to_string(),
            agent: lead,
            skill_id: format!("{pod_id}.{lead}"),
            instructions: format!(
                "Review the deliverables from the {} angle: {}",
                pod.name, pod.description
            ),
            acceptance: vec![format!("{} findings recorded", pod.name)],
            inputs: strings(&["quality_report.md"]),
            outputs: vec![format!("{pod_id}_review.md")],
        });
    }

    tasks.into_iter().map(|d| d.into_task(Phase::Verify)).collect()
}

fn ship_tasks() -> Vec<PlanTask> {
    vec![
        Draft {
            task_id: "ship-finalize".into(),
            title: "Package the deliverables and write the closure summary".into(),
            pod_id: "core".into(),
            agent: "delivery_tracker",
            skill_id: "core.delivery_tracker".into(),
            instructions: "Confirm every output is present and organized. Summarize what \
                           shipped (with paths), what was deferred, and recommended next steps."
                .into(),
            acceptance: strings(&[
                "All planned deliverables accounted for",
                "Deferred items documented",
                "Closure summary produced",
            ]),
            inputs: strings(&["quality_report.md", "build_summary.md"]),
            outputs: strings(&["closure_summary.md"]),
        },
        Draft {
            task_id: "ship-docs".into(),
            title: "Assemble final documentation and handoff notes".into(),
            pod_id: "core".into(),
            agent: "scribe",
            skill_id: "core.scribe".into(),
            instructions: "Compile the project summary, decision log, deliverable index, and \
                           handoff notes for downstream owners."
                .into(),
            acceptance: strings(&[
                "Documentation is complete and indexed",
                "Handoff notes are actionable",
            ]),
            inputs: strings(&["closure_summary.md", "decision_log.md"]),
            outputs: strings(&["final_documentation/"]),
        },
    ]
    .into_iter()
    .map(|d| d.into_task(Phase::Ship))
    .collect()
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn decompose(intent: &Intent, selected: &[SkillReason]) -> Plan {
    let pods = pods::select_pods(&intent.raw_text, &intent.industry, &intent.pod_hints);
    let kernels = pods::select_kernels(&intent.industry, &intent.raw_text);

    let mut phases = vec![
        PlanPhase {
            name: Phase::Discovery,
            tasks: discovery_tasks(&pods, &kernels),
        },
        PlanPhase {
            name: Phase::Build,
            tasks: build_tasks(&kernels, selected),
        },
        PlanPhase {
            name: Phase::Verify,
            tasks: verify_tasks(&pods, &kernels),
        },
        PlanPhase {
            name: Phase::Ship,
            tasks: ship_tasks(),
        },
    ];

    let mut order = 0u32;
    for task in phases.iter_mut().flat_map(|p| p.tasks.iter_mut()) {
        order += 1;
        task.order_index = order;
    }

    let mut assignments: Vec<PodAssignment> = pods
        .values()
        .map(|pod| PodAssignment {
            pod_id: pod.pod_id.to_string(),
            pod_name: pod.name.to_string(),
            agents: strings(pod.agents),
            always_on: pod.always_on,
            kernel_id: None,
        })
        .collect();
    assignments.extend(kernels.iter().map(|k| PodAssignment {
        pod_id: format!("kernel.{}", k.kernel_id),
        pod_name: k.name.to_string(),
        agents: Vec::new(),
        always_on: false,
        kernel_id: Some(k.kernel_id.to_string()),
    }));

    let plan = Plan {
        plan_id: uuid::Uuid::new_v4().to_string(),
        summary: PlanSummary {
            risk_tier: intent.risk_tier,
            evidence_level: intent.evidence_level,
            industry: intent.industry.clone(),
            project_type: intent.project_type,
            goal_count: intent.goals.len(),
            constraint_count: intent.constraints.len(),
            deliverable_count: intent.deliverables.len(),
            kernel_count: kernels.len(),
            pod_count: pods.len(),
        },
        pods: assignments,
        kernels: kernels
            .iter()
            .map(|k| KernelRef {
                kernel_id: k.kernel_id.to_string(),
                name: k.name.to_string(),
                description: k.description.to_string(),
            })
            .collect(),
        phases,
        gates: standard_gates(),
    };

    tracing::debug!(
        plan_id = %plan.plan_id,
        tasks = plan.total_tasks(),
        pods = plan.summary.pod_count,
        kernels = plan.summary.kernel_count,
        "plan decomposed"
    );
    plan
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
