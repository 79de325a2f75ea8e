use crate::types::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DISCOVERY_GATE: &str = "gate-1";
pub const QUALITY_GATE: &str = "gate-2";

/// Actor recorded when a gate clears because its source phase finished.
pub const SYSTEM_APPROVER: &str = "system-auto";

// ---------------------------------------------------------------------------
// GateDefinition
// ---------------------------------------------------------------------------

/// Approval checkpoint guarding entry into a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDefinition {
    pub gate_id: String,
    pub criteria: Vec<String>,
    pub owner: String,
}

pub fn standard_gates() -> Vec<GateDefinition> {
    vec![
        GateDefinition {
            gate_id: DISCOVERY_GATE.to_string(),
            criteria: vec!["Discovery reviewed and goals confirmed".to_string()],
            owner: "orchestrator".to_string(),
        },
        GateDefinition {
            gate_id: QUALITY_GATE.to_string(),
            criteria: vec!["Quality checks complete, deliverables verified".to_string()],
            owner: "quality".to_string(),
        },
    ]
}

/// Gate that must be approved before tasks of `phase` are handed out.
pub fn gate_for_phase(phase: Phase) -> Option<&'static str> {
    match phase {
        Phase::Build => Some(DISCOVERY_GATE),
        Phase::Ship => Some(QUALITY_GATE),
        Phase::Discovery | Phase::Verify => None,
    }
}

/// Phase whose completion auto-approves `gate_id`.
pub fn source_phase(gate_id: &str) -> Option<Phase> {
    match gate_id {
        DISCOVERY_GATE => Some(Phase::Discovery),
        QUALITY_GATE => Some(Phase::Verify),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// GateApproval
// ---------------------------------------------------------------------------

/// Unique per (project_id, gate_id); re-approval overwrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateApproval {
    pub project_id: String,
    pub gate_id: String,
    pub approved_by: String,
    #[serde(default)]
    pub note: String,
    pub approved_at: DateTime<Utc>,
}

impl GateApproval {
    pub fn new(project_id: &str, gate_id: &str, approved_by: &str, note: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            gate_id: gate_id.to_string(),
            approved_by: approved_by.to_string(),
            note: note.to_string(),
            approved_at: Utc::now(),
        }
    }

    /// System approval for a phase whose tasks are all terminal.
    pub fn automatic(project_id: &str, gate_id: &str, phase: Phase) -> Self {
        Self::new(
            project_id,
            gate_id,
            SYSTEM_APPROVER,
            &format!("All {phase} tasks completed"),
        )
    }

    pub fn is_automatic(&self) -> bool {
        self.approved_by == SYSTEM_APPROVER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_gate_mapping_round_trips() {
        for gate in standard_gates() {
            let source = source_phase(&gate.gate_id).unwrap();
            let guarded = source.next().unwrap();
            assert_eq!(gate_for_phase(guarded), Some(gate.gate_id.as_str()));
        }
        assert_eq!(gate_for_phase(Phase::Discovery), None);
        assert_eq!(gate_for_phase(Phase::Verify), None);
    }

    #[test]
    fn automatic_approval_note() {
        let approval = GateApproval::automatic("p1", DISCOVERY_GATE, Phase::Discovery);
        assert!(approval.is_automatic());
        assert_eq!(approval.note, "All discovery tasks completed");
    }
}
