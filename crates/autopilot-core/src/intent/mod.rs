//! Brief → [`Intent`].
//!
//! Extraction is a pure function of the brief text plus static tables. The
//! only impure tier is the optional [`IndustryClassifier`], which is never
//! required for a result.

pub mod extract;
pub mod industry;
pub mod signals;

pub use industry::{classify_by_keywords, IndustryClassifier, INDUSTRY_THRESHOLD};

use crate::error::{AutopilotError, Result};
use crate::hashing::content_hash;
use crate::paths::BRIEF_FILE;
use crate::types::{EvidenceLevel, ProjectType, RiskTier};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Shortest trimmed brief that can be routed.
pub const MIN_BRIEF_CHARS: usize = 40;

/// Token-set similarity below which an edited brief counts as a new brief.
pub const MATERIAL_CHANGE_JACCARD: f64 = 0.95;

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub goals: Vec<String>,
    pub constraints: Vec<String>,
    pub deliverables: Vec<String>,
    pub risk_tier: RiskTier,
    pub evidence_level: EvidenceLevel,
    #[serde(default)]
    pub industry: String,
    pub project_type: ProjectType,
    #[serde(default)]
    pub pod_hints: BTreeSet<String>,
    pub raw_text: String,
}

impl Intent {
    /// sha256 of the canonical JSON form.
    pub fn hash(&self) -> Result<String> {
        content_hash(self)
    }

    pub fn is_material_change(&self, new: &Intent) -> bool {
        is_material_change(self, new)
    }
}

// ---------------------------------------------------------------------------
// IntentExtractor
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct IntentExtractor {
    classifier: Option<Box<dyn IndustryClassifier>>,
}

impl IntentExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classifier(classifier: Box<dyn IndustryClassifier>) -> Self {
        Self {
            classifier: Some(classifier),
        }
    }

    pub fn extract(&self, text: &str) -> Result<Intent> {
        let raw = text.trim();
        if raw.is_empty() {
            return Err(AutopilotError::BriefEmpty);
        }
        let len = raw.chars().count();
        if len < MIN_BRIEF_CHARS {
            return Err(AutopilotError::BriefTooShort { len });
        }

        let items = extract::extract_items(raw);
        Ok(Intent {
            goals: items.goals,
            constraints: items.constraints,
            deliverables: items.deliverables,
            risk_tier: signals::infer_risk(raw),
            evidence_level: signals::infer_evidence(raw),
            industry: self.detect_industry(raw),
            project_type: signals::infer_project_type(raw),
            pod_hints: signals::pod_hints(raw),
            raw_text: raw.to_string(),
        })
    }

    fn detect_industry(&self, text: &str) -> String {
        if let Some(classifier) = &self.classifier {
            match classifier.classify(text) {
                Ok(industry) if !industry.trim().is_empty() => {
                    return industry.trim().to_string();
                }
                Ok(_) => {
                    tracing::debug!("industry classifier returned nothing, using keyword table");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "industry classifier failed, using keyword table");
                }
            }
        }
        classify_by_keywords(text)
    }
}

impl std::fmt::Debug for IntentExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentExtractor")
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

/// Keyword-only extraction.
pub fn extract_intent(text: &str) -> Result<Intent> {
    IntentExtractor::new().extract(text)
}

// ---------------------------------------------------------------------------
// Material change
// ---------------------------------------------------------------------------

static WORD_RE: OnceLock<Regex> = OnceLock::new();

fn word_re() -> &'static Regex {
    WORD_RE.get_or_init(|| Regex::new(r"[a-zA-Z0-9_]+").unwrap())
}

fn word_set(text: &str) -> BTreeSet<String> {
    let lowered = text.to_lowercase();
    word_re()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}

pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let old = word_set(a);
    let new = word_set(b);
    if old.is_empty() && new.is_empty() {
        return 1.0;
    }
    let overlap = old.intersection(&new).count();
    let union = old.union(&new).count().max(1);
    overlap as f64 / union as f64
}

/// Risk or evidence moved, or the wording drifted past the Jaccard bar.
pub fn is_material_change(previous: &Intent, new: &Intent) -> bool {
    previous.risk_tier != new.risk_tier
        || previous.evidence_level != new.evidence_level
        || token_jaccard(&previous.raw_text, &new.raw_text) < MATERIAL_CHANGE_JACCARD
}

// ---------------------------------------------------------------------------
// Brief files
// ---------------------------------------------------------------------------

/// Strip wrapping quotes and turn `file://` URIs into plain paths.
pub fn normalize_brief_input(input: &str) -> String {
    let mut cleaned = input.trim();
    if cleaned.len() >= 2 {
        let first = cleaned.as_bytes()[0];
        let last = cleaned.as_bytes()[cleaned.len() - 1];
        if first == last && (first == b'\'' || first == b'"') {
            cleaned = cleaned[1..cleaned.len() - 1].trim();
        }
    }
    if cleaned.starts_with("file://") {
        if let Ok(url) = url::Url::parse(cleaned) {
            if let Ok(path) = url.to_file_path() {
                return path.to_string_lossy().into_owned();
            }
            if let Some(host) = url.host_str() {
                return format!("//{host}{}", url.path());
            }
        }
    }
    cleaned.to_string()
}

/// A directory means its `project_brief.md`; a missing file is looked up
/// case-insensitively in its parent.
pub fn resolve_brief_path(input: &str) -> PathBuf {
    let mut path = crate::paths::expand_home(Path::new(&normalize_brief_input(input)));
    if path.is_dir() {
        path = path.join(BRIEF_FILE);
    }
    if path.exists() {
        return path;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        let target = name.to_string_lossy().to_lowercase();
        if let Ok(entries) = std::fs::read_dir(parent) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().to_lowercase() == target {
                    return entry.path();
                }
            }
        }
    }
    path
}

/// Read a brief, returning its trimmed text and the resolved path.
pub fn read_brief(input: &str) -> Result<(String, PathBuf)> {
    if input.trim().is_empty() {
        return Err(AutopilotError::BriefUnreadable {
            path: String::new(),
            reason: "brief path is required".into(),
        });
    }
    let path = resolve_brief_path(input);
    let text = std::fs::read_to_string(&path).map_err(|e| AutopilotError::BriefUnreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok((text.trim().to_string(), path))
}

/// Read and extract a brief file; returns the intent and its hash.
pub fn parse_brief(input: &str) -> Result<(Intent, String)> {
    let (text, path) = read_brief(input)?;
    let intent = extract_intent(&text)?;
    let hash = intent.hash()?;
    tracing::debug!(path = %path.display(), hash = %hash, "parsed brief");
    Ok((intent, hash))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAYMENTS: &str =
        "# Goals\n- Build a payment gateway.\n# Constraints\n- Must be regulated and auditable.";

    #[test]
    fn payments_scenario() {
        let intent = extract_intent(PAYMENTS).unwrap();
        assert_eq!(intent.goals, vec!["Build a payment gateway."]);
        assert_eq!(intent.constraints, vec!["Must be regulated and auditable."]);
        assert_eq!(intent.risk_tier, RiskTier::High);
        assert_eq!(intent.evidence_level, EvidenceLevel::Standard);
        assert_eq!(intent.project_type, ProjectType::NewBuild);
        assert_eq!(intent.industry, "Payments / Fintech");
    }

    #[test]
    fn short_and_empty_briefs_fail() {
        assert!(matches!(
            extract_intent("   \n "),
            Err(AutopilotError::BriefEmpty)
        ));
        assert!(matches!(
            extract_intent("tiny brief"),
            Err(AutopilotError::BriefTooShort { len: 10 })
        ));
    }

    #[test]
    fn extraction_is_deterministic() {
        let a = extract_intent(PAYMENTS).unwrap();
        let b = extract_intent(PAYMENTS).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    struct FixedClassifier(Result<String>);

    impl IndustryClassifier for FixedClassifier {
        fn classify(&self, _text: &str) -> Result<String> {
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(AutopilotError::InvalidConfig("offline".into())),
            }
        }
    }

    #[test]
    fn classifier_first_then_keywords() {
        let ok = IntentExtractor::with_classifier(Box::new(FixedClassifier(Ok("Insurance".into()))));
        assert_eq!(ok.extract(PAYMENTS).unwrap().industry, "Insurance");

        let failing = IntentExtractor::with_classifier(Box::new(FixedClassifier(Err(
            AutopilotError::InvalidConfig("x".into()),
        ))));
        assert_eq!(failing.extract(PAYMENTS).unwrap().industry, "Payments / Fintech");

        let empty = IntentExtractor::with_classifier(Box::new(FixedClassifier(Ok("  ".into()))));
        assert_eq!(empty.extract(PAYMENTS).unwrap().industry, "Payments / Fintech");
    }

    #[test]
    fn trivial_edit_is_not_material() {
        let base = "# Goals\n- Build an internal reporting dashboard for the sales team with weekly exports \
                    covering pipeline, bookings, churn, renewals, quota attainment, regional splits, product \
                    lines, partner sourced deals, forecast accuracy, win rates, cycle length, discounting, \
                    and executive summary views for leadership review meetings";
        let a = extract_intent(base).unwrap();
        let b = extract_intent(&format!("{base}.")).unwrap();
        assert!(!is_material_change(&a, &b));
    }

    #[test]
    fn risk_change_is_material() {
        let a = extract_intent("Build a reporting dashboard for the sales team with exports").unwrap();
        let b = extract_intent("Build a reporting dashboard for the medical team with exports").unwrap();
        assert_ne!(a.risk_tier, b.risk_tier);
        assert!(a.is_material_change(&b));
    }

    #[test]
    fn large_rewrite_is_material() {
        let a = extract_intent("Build a reporting dashboard for the sales team with exports").unwrap();
        let b = extract_intent("Write a data migration tool for the warehouse inventory records").unwrap();
        assert!(is_material_change(&a, &b));
    }

    #[test]
    fn normalize_quotes_and_file_uris() {
        assert_eq!(normalize_brief_input("  '/tmp/x.md' "), "/tmp/x.md");
        assert_eq!(
            normalize_brief_input("file:///tmp/my%20brief.md"),
            "/tmp/my brief.md"
        );
    }

    #[test]
    fn directory_resolves_to_brief_file_case_insensitively() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Project_Brief.MD"), PAYMENTS).unwrap();
        let resolved = resolve_brief_path(dir.path().to_str().unwrap());
        assert_eq!(resolved, dir.path().join("Project_Brief.MD"));

        let (intent, hash) = parse_brief(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(intent.risk_tier, RiskTier::High);
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn missing_brief_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let err = parse_brief(dir.path().join("nope.md").to_str().unwrap()).unwrap_err();
        assert!(matches!(err, AutopilotError::BriefUnreadable { .. }));
        assert!(err.is_validation());
    }
}
