use crate::pods::{attachable_pod, POD_SIGNAL_KEYWORDS};
use crate::types::{EvidenceLevel, ProjectType, RiskTier};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub const HIGH_RISK_TERMS: &[&str] = &[
    "regulated",
    "safety",
    "compliance",
    "financial controls",
    "medical",
];

pub const LOW_RISK_TERMS: &[&str] = &["prototype", "demo", "internal only"];

pub const STRICT_EVIDENCE_TERMS: &[&str] = &[
    "audit",
    "traceability",
    "evidence",
    "change control",
    "approval",
];

/// Distinct strict-evidence terms needed for `EvidenceLevel::Strict`.
pub const STRICT_EVIDENCE_MIN_HITS: usize = 2;

/// Checked in order; the first group with any hit wins.
pub const PROJECT_TYPE_SIGNALS: &[(ProjectType, &[&str])] = &[
    (
        ProjectType::NewBuild,
        &[
            "build a",
            "build an",
            "from scratch",
            "greenfield",
            "new product",
            "launch",
            "create a",
            "develop a",
        ],
    ),
    (
        ProjectType::Migration,
        &[
            "migrate",
            "migration",
            "port to",
            "move to",
            "upgrade from",
            "legacy",
        ],
    ),
    (
        ProjectType::Integration,
        &["integrate", "integration", "connect to", "sync with", "webhook"],
    ),
    (
        ProjectType::Refactor,
        &["refactor", "restructure", "clean up", "modernize", "rewrite"],
    ),
    (
        ProjectType::Automation,
        &["automate", "automation", "workflow", "pipeline", "scheduled job"],
    ),
    (
        ProjectType::Analysis,
        &[
            "analyze",
            "analyse",
            "analysis",
            "assessment",
            "evaluate",
            "investigate",
        ],
    ),
];

static POD_LINE_RE: OnceLock<Regex> = OnceLock::new();

fn pod_line_re() -> &'static Regex {
    POD_LINE_RE.get_or_init(|| Regex::new(r"(?im)^\s*(?:[-*]\s+)?pods?\s*:\s*(.+)$").unwrap())
}

pub fn infer_risk(text: &str) -> RiskTier {
    let lowered = text.to_lowercase();
    if HIGH_RISK_TERMS.iter().any(|t| lowered.contains(t)) {
        RiskTier::High
    } else if LOW_RISK_TERMS.iter().any(|t| lowered.contains(t)) {
        RiskTier::Low
    } else {
        RiskTier::Medium
    }
}

pub fn infer_evidence(text: &str) -> EvidenceLevel {
    let lowered = text.to_lowercase();
    let hits = STRICT_EVIDENCE_TERMS
        .iter()
        .filter(|t| lowered.contains(*t))
        .count();
    if hits >= STRICT_EVIDENCE_MIN_HITS {
        EvidenceLevel::Strict
    } else {
        EvidenceLevel::Standard
    }
}

pub fn infer_project_type(text: &str) -> ProjectType {
    let lowered = text.to_lowercase();
    PROJECT_TYPE_SIGNALS
        .iter()
        .find(|(_, terms)| terms.iter().any(|t| lowered.contains(t)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ProjectType::General)
}

/// Pods signalled by keywords, plus any named on an explicit `Pods:` line.
pub fn pod_hints(text: &str) -> BTreeSet<String> {
    let lowered = text.to_lowercase();
    let mut hints: BTreeSet<String> = POD_SIGNAL_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| lowered.contains(kw)))
        .map(|(pod_id, _)| pod_id.to_string())
        .collect();

    for caps in pod_line_re().captures_iter(text) {
        for name in caps[1].split(',') {
            let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");
            if attachable_pod(&normalized).is_some() {
                hints.insert(normalized);
            }
        }
    }

    hints
}
