use crate::gate::GateDefinition;
use crate::types::{EvidenceLevel, Phase, ProjectType, RiskTier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bumped whenever the stored plan layout changes.
pub const PLAN_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// PlanTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTask {
    pub task_id: String,
    pub title: String,
    pub phase: Phase,
    pub pod_id: String,
    pub agent: String,
    pub skill_id: String,
    pub instructions: String,
    pub acceptance_criteria: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub guardrails: Vec<String>,
    /// 1-based position in the whole plan.
    pub order_index: u32,
    /// Adapter-specific metadata only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: Phase,
    pub tasks: Vec<PlanTask>,
}

// ---------------------------------------------------------------------------
// Plan metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodAssignment {
    pub pod_id: String,
    pub pod_name: String,
    pub agents: Vec<String>,
    pub always_on: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRef {
    pub kernel_id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub risk_tier: RiskTier,
    pub evidence_level: EvidenceLevel,
    pub industry: String,
    pub project_type: ProjectType,
    pub goal_count: usize,
    pub constraint_count: usize,
    pub deliverable_count: usize,
    pub kernel_count: usize,
    pub pod_count: usize,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Immutable once built; a reroute produces a new plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub summary: PlanSummary,
    pub pods: Vec<PodAssignment>,
    pub kernels: Vec<KernelRef>,
    pub phases: Vec<PlanPhase>,
    pub gates: Vec<GateDefinition>,
}

impl Plan {
    /// Every task in `order_index` order.
    pub fn tasks(&self) -> impl Iterator<Item = &PlanTask> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    pub fn task(&self, task_id: &str) -> Option<&PlanTask> {
        self.tasks().find(|t| t.task_id == task_id)
    }

    pub fn phase_tasks(&self, phase: Phase) -> &[PlanTask] {
        self.phases
            .iter()
            .find(|p| p.name == phase)
            .map(|p| p.tasks.as_slice())
            .unwrap_or(&[])
    }

    pub fn gate(&self, gate_id: &str) -> Option<&GateDefinition> {
        self.gates.iter().find(|g| g.gate_id == gate_id)
    }

    pub fn total_tasks(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }
}
