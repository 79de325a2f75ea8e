//! Skill selection.
//!
//! One deterministic greedy pass over the scored catalog, then dependency
//! closure, then conflict resolution. Every candidate ends up in exactly one
//! of `selected_skills` / `rejected_skills`, each with a reason.

use crate::catalog::SkillMetadata;
use crate::error::Result;
use crate::hashing::content_hash;
use crate::intent::Intent;
use crate::policy::RoutingPolicy;
use crate::types::{EvidenceLevel, Host, RiskTier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

pub const HOST_BONUS: f64 = 0.15;
pub const HOST_MISMATCH_PENALTY: f64 = -1.0;
pub const EVIDENCE_BONUS: f64 = 0.10;
pub const RISK_BONUS: f64 = 0.15;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillReason {
    pub skill_id: String,
    pub reason: String,
}

impl SkillReason {
    fn new(skill_id: &str, reason: impl Into<String>) -> Self {
        Self {
            skill_id: skill_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub route_id: String,
    pub plan_hash: String,
    /// Sorted by skill id.
    pub selected_skills: Vec<SkillReason>,
    /// In rejection order.
    pub rejected_skills: Vec<SkillReason>,
    pub snapshot_hash: String,
}

impl RouteResult {
    pub fn selected_ids(&self) -> Vec<&str> {
        self.selected_skills
            .iter()
            .map(|s| s.skill_id.as_str())
            .collect()
    }

    pub fn is_selected(&self, skill_id: &str) -> bool {
        self.selected_skills.iter().any(|s| s.skill_id == skill_id)
    }

    pub fn rejection(&self, skill_id: &str) -> Option<&str> {
        self.rejected_skills
            .iter()
            .find(|s| s.skill_id == skill_id)
            .map(|s| s.reason.as_str())
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Lowercase alphanumeric runs; `_`, `-`, `.` and all punctuation split.
pub fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillScore {
    pub skill_id: String,
    pub score: f64,
    pub reason: String,
    pub host_supported: bool,
    pub utility: bool,
    pub explicitly_requested: bool,
}

impl SkillScore {
    fn utility_penalized(&self) -> bool {
        self.utility && !self.explicitly_requested
    }
}

/// Per-call scoring state. Intent tokens are computed once.
pub struct Scorer<'a> {
    intent: &'a Intent,
    intent_tokens: BTreeSet<String>,
    allow_terms: BTreeSet<String>,
    hosts: &'a [Host],
    policy: &'a RoutingPolicy,
}

impl<'a> Scorer<'a> {
    pub fn new(intent: &'a Intent, hosts: &'a [Host], policy: &'a RoutingPolicy) -> Self {
        Self {
            intent,
            intent_tokens: tokens(&intent.raw_text),
            allow_terms: policy
                .utility_allow_terms
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            hosts,
            policy,
        }
    }

    /// The brief literally names a utility term that also appears in the
    /// skill's id or name.
    pub fn explicitly_requested(&self, skill: &SkillMetadata) -> bool {
        let mut skill_tokens = tokens(&skill.skill_id);
        skill_tokens.extend(tokens(&skill.name));
        skill_tokens
            .iter()
            .any(|t| self.allow_terms.contains(t) && self.intent_tokens.contains(t))
    }

    pub fn score(&self, skill: &SkillMetadata) -> SkillScore {
        let mut text = format!("{} {}", skill.name, skill.description);
        for tag in &skill.tags {
            text.push(' ');
            text.push_str(tag);
        }
        let skill_tokens = tokens(&text);
        let overlap = skill_tokens.intersection(&self.intent_tokens).count();
        let coverage = overlap as f64 / skill_tokens.len().max(1) as f64;

        let host_supported = skill.supports_any(self.hosts);
        let host_bonus = if host_supported {
            HOST_BONUS
        } else {
            HOST_MISMATCH_PENALTY
        };
        let evidence_bonus =
            if self.intent.evidence_level == EvidenceLevel::Strict && skill.has_tag("quality") {
                EVIDENCE_BONUS
            } else {
                0.0
            };
        let risk_bonus = if self.intent.risk_tier == RiskTier::High && skill.has_tag("risk") {
            RISK_BONUS
        } else {
            0.0
        };
        let preferred_bonus = if self.policy.is_preferred_source(&skill.source_repo) {
            self.policy.preferred_source_bonus
        } else {
            0.0
        };

        let utility = self.policy.is_utility(&skill.skill_id.to_lowercase());
        let explicit = utility && self.explicitly_requested(skill);
        let utility_penalty = if utility && !explicit {
            self.policy.utility_penalty
        } else {
            0.0
        };

        let score =
            coverage + host_bonus + evidence_bonus + risk_bonus + preferred_bonus - utility_penalty;

        let mut parts: Vec<String> = Vec::new();
        if overlap > 0 {
            parts.push(format!("matched {overlap} intent terms"));
        }
        if host_supported {
            parts.push("host-compatible".into());
        }
        if evidence_bonus > 0.0 {
            parts.push("strict-evidence support".into());
        }
        if risk_bonus > 0.0 {
            parts.push("high-risk support".into());
        }
        if utility && !explicit {
            parts.push("utility penalty".into());
        }
        if explicit {
            parts.push("explicitly requested".into());
        }
        if preferred_bonus != 0.0 {
            parts.push("preferred source".into());
        }
        let reason = if parts.is_empty() {
            "fallback match".to_string()
        } else {
            parts.join(", ")
        };

        SkillScore {
            skill_id: skill.skill_id.clone(),
            score,
            reason,
            host_supported,
            utility,
            explicitly_requested: explicit,
        }
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Greedy pass over candidates sorted by `(-score, skill_id)`. Returns the
/// selections in pick order.
fn greedy_select(
    scored: &[SkillScore],
    policy: &RoutingPolicy,
    rejected: &mut Vec<SkillReason>,
) -> Vec<SkillScore> {
    let mut selected: Vec<SkillScore> = Vec::new();
    let mut cluster_counts: HashMap<&str, usize> = HashMap::new();
    let mut utility_count = 0usize;

    for candidate in scored {
        let id = candidate.skill_id.as_str();

        if policy.is_excluded(id) {
            rejected.push(SkillReason::new(id, "excluded by policy"));
            continue;
        }
        if selected.len() >= policy.max_active_skills {
            rejected.push(SkillReason::new(id, "policy max_active_skills exceeded"));
            continue;
        }
        if !candidate.host_supported {
            rejected.push(SkillReason::new(id, "host incompatibility"));
            continue;
        }
        if candidate.score < policy.min_relevance_score {
            let reason = if candidate.utility_penalized() {
                "below relevance threshold (utility penalty)"
            } else {
                "below relevance threshold"
            };
            rejected.push(SkillReason::new(id, reason));
            continue;
        }
        let cluster = id.split('.').next().unwrap_or(id);
        let in_cluster = cluster_counts.get(cluster).copied().unwrap_or(0);
        if in_cluster >= policy.max_skills_per_cluster {
            rejected.push(SkillReason::new(
                id,
                format!("cluster cap exceeded: {cluster}"),
            ));
            continue;
        }
        if candidate.utility {
            if utility_count >= policy.max_utility_skills {
                rejected.push(SkillReason::new(id, "utility skill cap exceeded"));
                continue;
            }
            utility_count += 1;
        }

        *cluster_counts.entry(cluster).or_insert(0) += 1;
        selected.push(candidate.clone());
    }

    selected
}

/// BFS over declared dependencies. Pulled-in skills score 0 and ignore caps
/// and excluded prefixes: a selected skill always gets what it depends on.
fn dependency_closure(
    selected: &mut Vec<SkillScore>,
    by_id: &BTreeMap<&str, &SkillMetadata>,
    host_targets: &[Host],
) {
    let mut present: BTreeSet<String> = selected.iter().map(|s| s.skill_id.clone()).collect();
    let mut queue: VecDeque<String> = selected.iter().map(|s| s.skill_id.clone()).collect();

    while let Some(current) = queue.pop_front() {
        let Some(skill) = by_id.get(current.as_str()) else {
            continue;
        };
        for dep in &skill.dependencies {
            if present.contains(dep) {
                continue;
            }
            let Some(dep_skill) = by_id.get(dep.as_str()) else {
                tracing::debug!(skill_id = %current, dependency = %dep, "dependency not in catalog");
                continue;
            };
            present.insert(dep.clone());
            selected.push(SkillScore {
                skill_id: dep_skill.skill_id.clone(),
                score: 0.0,
                reason: format!("dependency of {current}"),
                host_supported: dep_skill.supports_any(host_targets),
                utility: false,
                explicitly_requested: false,
            });
            queue.push_back(dep.clone());
        }
    }
}

/// Drop one side of every conflicting pair. The current skill is kept when
/// `(score, id) >= (other.score, other_id)`.
fn resolve_conflicts(
    selected: Vec<SkillScore>,
    by_id: &BTreeMap<&str, &SkillMetadata>,
    rejected: &mut Vec<SkillReason>,
) -> Vec<SkillScore> {
    let scores: HashMap<String, f64> = selected
        .iter()
        .map(|s| (s.skill_id.clone(), s.score))
        .collect();
    let mut dropped: BTreeSet<String> = BTreeSet::new();

    for current in &selected {
        let id = current.skill_id.as_str();
        if dropped.contains(id) {
            continue;
        }
        let Some(skill) = by_id.get(id) else {
            continue;
        };
        for other_id in &skill.conflicts {
            if dropped.contains(other_id) {
                continue;
            }
            let Some(other_score) = scores.get(other_id) else {
                continue;
            };
            let keep_current = match current.score.total_cmp(other_score) {
                std::cmp::Ordering::Equal => id >= other_id.as_str(),
                ord => ord.is_gt(),
            };
            if keep_current {
                rejected.push(SkillReason::new(other_id, format!("conflicts with {id}")));
                dropped.insert(other_id.clone());
            } else {
                rejected.push(SkillReason::new(id, format!("conflicts with {other_id}")));
                dropped.insert(id.to_string());
                break;
            }
        }
    }

    selected
        .into_iter()
        .filter(|s| !dropped.contains(&s.skill_id))
        .collect()
}

#[derive(Serialize)]
struct PlanHashInput<'a> {
    intent: &'a Intent,
    selected: &'a [SkillReason],
    snapshot_hash: &'a str,
}

/// Score, select, close over dependencies, and resolve conflicts.
///
/// Identical inputs give an identical `plan_hash` and selection; only
/// `route_id` is fresh per call.
pub fn route(
    intent: &Intent,
    catalog: &[SkillMetadata],
    host_targets: &[Host],
    policy: &RoutingPolicy,
    snapshot_hash: &str,
) -> Result<RouteResult> {
    let by_id: BTreeMap<&str, &SkillMetadata> =
        catalog.iter().map(|s| (s.skill_id.as_str(), s)).collect();

    let scorer = Scorer::new(intent, host_targets, policy);
    let mut scored: Vec<SkillScore> = by_id.values().map(|s| scorer.score(s)).collect();
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.skill_id.cmp(&b.skill_id))
    });

    let mut rejected: Vec<SkillReason> = Vec::new();
    let mut selected = greedy_select(&scored, policy, &mut rejected);
    let first_class = selected.len();
    dependency_closure(&mut selected, &by_id, host_targets);

    // Closure wins over an earlier greedy rejection of the same skill.
    let pulled: BTreeSet<&str> = selected[first_class..]
        .iter()
        .map(|s| s.skill_id.as_str())
        .collect();
    rejected.retain(|r| !pulled.contains(r.skill_id.as_str()));

    let selected = resolve_conflicts(selected, &by_id, &mut rejected);

    let mut selected_skills: Vec<SkillReason> = selected
        .iter()
        .map(|s| SkillReason::new(&s.skill_id, s.reason.clone()))
        .collect();
    selected_skills.sort_by(|a, b| a.skill_id.cmp(&b.skill_id));

    for r in &rejected {
        tracing::debug!(skill_id = %r.skill_id, reason = %r.reason, "skill rejected");
    }

    let plan_hash = content_hash(&PlanHashInput {
        intent,
        selected: &selected_skills,
        snapshot_hash,
    })?;

    tracing::info!(
        selected = selected_skills.len(),
        rejected = rejected.len(),
        plan_hash = %plan_hash,
        "route computed"
    );

    Ok(RouteResult {
        route_id: uuid::Uuid::new_v4().to_string(),
        plan_hash,
        selected_skills,
        rejected_skills: rejected,
        snapshot_hash: snapshot_hash.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
