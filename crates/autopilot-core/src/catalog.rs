//! Skill catalog loading.
//!
//! A catalog is the built-in skills overlaid by every configured source in
//! order (last source wins per `skill_id`), sorted by id. Each source is a
//! directory tree of `SKILL.md` files; a skill's id is its directory path
//! relative to the source root with separators turned into dots.

use crate::error::Result;
use crate::hashing::content_hash;
use crate::paths::SKILL_FILE;
use crate::types::Host;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

pub const BUILTIN_SOURCE: &str = "builtin";
pub const BUILTIN_REF: &str = "builtin-v1";
const DEFAULT_DESCRIPTION: &str = "Skill template";
const DEFAULT_TAG_COUNT: usize = 4;
const MIN_DESCRIPTION_CHARS: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSource {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_pinned_ref")]
    pub pinned_ref: String,
}

fn default_pinned_ref() -> String {
    "local".to_string()
}

impl CatalogSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            pinned_ref: default_pinned_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillMetadata {
    pub skill_id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub hosts: BTreeSet<Host>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub conflicts: BTreeSet<String>,
    pub source_repo: String,
    pub pinned_ref: String,
}

impl SkillMetadata {
    /// First dot-segment of the id.
    pub fn cluster(&self) -> &str {
        self.skill_id
            .split('.')
            .next()
            .unwrap_or(self.skill_id.as_str())
    }

    pub fn supports_any(&self, hosts: &[Host]) -> bool {
        hosts.iter().any(|h| self.hosts.contains(h))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Sorted skills plus the hash of their canonical JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub skills: Vec<SkillMetadata>,
    pub snapshot_hash: String,
}

impl Catalog {
    pub fn from_skills(skills: impl IntoIterator<Item = SkillMetadata>) -> Result<Self> {
        let merged: BTreeMap<String, SkillMetadata> = skills
            .into_iter()
            .map(|s| (s.skill_id.clone(), s))
            .collect();
        let skills: Vec<SkillMetadata> = merged.into_values().collect();
        let snapshot_hash = content_hash(&skills)?;
        Ok(Self {
            skills,
            snapshot_hash,
        })
    }

    pub fn get(&self, skill_id: &str) -> Option<&SkillMetadata> {
        self.skills
            .binary_search_by(|s| s.skill_id.as_str().cmp(skill_id))
            .ok()
            .map(|i| &self.skills[i])
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn builtin(
    skill_id: &str,
    name: &str,
    description: &str,
    tags: &[&str],
    dependencies: &[&str],
) -> SkillMetadata {
    SkillMetadata {
        skill_id: skill_id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        hosts: Host::all().iter().copied().collect(),
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        conflicts: BTreeSet::new(),
        source_repo: BUILTIN_SOURCE.to_string(),
        pinned_ref: BUILTIN_REF.to_string(),
    }
}

pub fn builtin_skills() -> Vec<SkillMetadata> {
    vec![
        builtin(
            "core.orchestrator",
            "Orchestrator",
            "Decomposes work and coordinates execution flow.",
            &["planning", "coordination", "delivery"],
            &[],
        ),
        builtin(
            "core.research",
            "Research",
            "Builds evidence-backed options and facts ledger.",
            &["research", "analysis", "evidence"],
            &[],
        ),
        builtin(
            "core.quality",
            "Quality",
            "Challenges assumptions, catches gaps, and validates acceptance criteria.",
            &["quality", "review", "risk"],
            &[],
        ),
        builtin(
            "kernel.digital_product",
            "Digital Product Kernel",
            "Build/ship workflows for software products with iterative delivery.",
            &["software", "product", "build", "ship"],
            &["core.orchestrator", "core.quality"],
        ),
    ]
}

// ---------------------------------------------------------------------------
// SKILL.md parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum FrontValue {
    Scalar(String),
    List(Vec<String>),
}

impl FrontValue {
    fn into_list(self) -> Vec<String> {
        match self {
            FrontValue::Scalar(s) => split_csv(&s),
            FrontValue::List(items) => items,
        }
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Split a leading `---` block from the body. Keys are lowercased.
fn split_front_matter(text: &str) -> (BTreeMap<String, FrontValue>, &str) {
    let mut parsed = BTreeMap::new();
    let Some(rest) = text.strip_prefix("---\n") else {
        return (parsed, text);
    };
    let (block, body) = match rest.find("\n---\n") {
        Some(end) => (&rest[..end], &rest[end + 5..]),
        None => match rest.strip_suffix("\n---") {
            Some(block) => (block, ""),
            None => return (parsed, text),
        },
    };

    for raw in block.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let parsed_value = match value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
            Some(inner) => FrontValue::List(split_csv(inner)),
            None => FrontValue::Scalar(value.trim_matches(|c| c == '"' || c == '\'').to_string()),
        };
        parsed.insert(key.trim().to_lowercase(), parsed_value);
    }

    (parsed, body)
}

#[derive(Debug, Default)]
struct InlineMeta {
    hosts: Vec<String>,
    tags: Vec<String>,
    dependencies: Vec<String>,
    conflicts: Vec<String>,
}

static INLINE_RE: OnceLock<Regex> = OnceLock::new();

fn inline_re() -> &'static Regex {
    INLINE_RE.get_or_init(|| {
        Regex::new(r"(?i)^(hosts|tags|depends-on|conflicts-with):\s*(.+)$").unwrap()
    })
}

fn parse_inline_meta(body: &str) -> InlineMeta {
    let mut meta = InlineMeta::default();
    for line in body.lines() {
        let Some(caps) = inline_re().captures(line.trim()) else {
            continue;
        };
        let values = split_csv(&caps[2]);
        match caps[1].to_lowercase().as_str() {
            "hosts" => meta.hosts.extend(values),
            "tags" => meta.tags.extend(values),
            "depends-on" => meta.dependencies.extend(values),
            _ => meta.conflicts.extend(values),
        }
    }
    meta
}

fn scalar(front: &BTreeMap<String, FrontValue>, key: &str) -> Option<String> {
    match front.get(key) {
        Some(FrontValue::Scalar(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn list(front: &mut BTreeMap<String, FrontValue>, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|k| front.remove(*k))
        .flat_map(FrontValue::into_list)
        .collect()
}

fn name_and_description(
    body: &str,
    front: &BTreeMap<String, FrontValue>,
    dir_name: &str,
) -> (String, String) {
    let lines: Vec<&str> = body.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let heading = lines
        .iter()
        .find(|l| l.starts_with('#'))
        .map(|l| l.trim_start_matches(['#', ' ']).trim())
        .filter(|h| !h.is_empty());
    let name = heading
        .map(String::from)
        .or_else(|| scalar(front, "name"))
        .unwrap_or_else(|| dir_name.to_string());

    let description = scalar(front, "description")
        .or_else(|| {
            lines
                .iter()
                .filter(|l| {
                    !(l.starts_with('#')
                        || l.starts_with("---")
                        || l.starts_with("name:")
                        || l.starts_with("description:")
                        || inline_re().is_match(l))
                })
                .find(|l| l.chars().count() >= MIN_DESCRIPTION_CHARS)
                .map(|l| l.to_string())
        })
        .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());

    (name, description)
}

fn default_tags(name: &str) -> BTreeSet<String> {
    name.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .take(DEFAULT_TAG_COUNT)
        .map(str::to_lowercase)
        .collect()
}

/// Keep known hosts; a skill with none left runs on the baseline host.
fn filter_hosts(skill_id: &str, raw: &[String]) -> BTreeSet<Host> {
    let mut hosts = BTreeSet::new();
    for name in raw {
        match name.parse::<Host>() {
            Ok(host) => {
                hosts.insert(host);
            }
            Err(_) => tracing::debug!(skill_id, host = %name, "dropping unsupported host"),
        }
    }
    if hosts.is_empty() {
        hosts.insert(Host::baseline());
    }
    hosts
}

/// Skill id from the descriptor's directory relative to the source root.
pub fn skill_id_for(skill_dir: &Path, root: &Path) -> String {
    let relative: Vec<String> = skill_dir
        .strip_prefix(root)
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    if relative.is_empty() {
        skill_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        relative.join(".")
    }
}

/// Parse one descriptor. `None` when the derived id is empty.
pub fn parse_skill(text: &str, skill_id: &str, source: &CatalogSource) -> Option<SkillMetadata> {
    if skill_id.is_empty() {
        return None;
    }
    let normalized = text.replace("\r\n", "\n");
    let (mut front, body) = split_front_matter(&normalized);
    let dir_name = skill_id.rsplit('.').next().unwrap_or(skill_id);
    let (name, description) = name_and_description(body, &front, dir_name);
    let meta = parse_inline_meta(body);

    let mut hosts = list(&mut front, &["hosts"]);
    hosts.extend(meta.hosts);
    let mut tags = list(&mut front, &["tags"]);
    tags.extend(meta.tags);
    let mut dependencies = list(&mut front, &["dependencies", "depends_on", "depends-on"]);
    dependencies.extend(meta.dependencies);
    let mut conflicts = list(&mut front, &["conflicts", "conflicts_with", "conflicts-with"]);
    conflicts.extend(meta.conflicts);

    let tags: BTreeSet<String> = if tags.is_empty() {
        default_tags(&name)
    } else {
        tags.iter().map(|t| t.to_lowercase()).collect()
    };

    Some(SkillMetadata {
        skill_id: skill_id.to_string(),
        hosts: filter_hosts(skill_id, &hosts),
        name,
        description,
        tags,
        dependencies: dependencies.into_iter().collect(),
        conflicts: conflicts.into_iter().collect(),
        source_repo: source.name.clone(),
        pinned_ref: source.pinned_ref.clone(),
    })
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn resolve_root(path: &Path) -> PathBuf {
    let expanded = crate::paths::expand_home(path);
    std::fs::canonicalize(&expanded).unwrap_or(expanded)
}

/// Walk one source, skipping files owned by a more specific nested root.
fn scan_source(
    source: &CatalogSource,
    root: &Path,
    all_roots: &[PathBuf],
) -> Vec<SkillMetadata> {
    let nested: Vec<&PathBuf> = all_roots
        .iter()
        .filter(|other| other.as_path() != root && other.starts_with(root))
        .collect();

    let mut skills = Vec::new();
    let walker = WalkDir::new(root).sort_by_file_name().into_iter();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || entry.file_name() != SKILL_FILE {
            continue;
        }
        let file = entry.path();
        if nested.iter().any(|inner| file.starts_with(inner)) {
            tracing::debug!(file = %file.display(), "skipping file owned by nested source");
            continue;
        }
        let Some(skill_dir) = file.parent() else {
            continue;
        };
        let text = match std::fs::read_to_string(file) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "unreadable skill file");
                continue;
            }
        };
        let skill_id = skill_id_for(skill_dir, root);
        if let Some(skill) = parse_skill(&text, &skill_id, source) {
            tracing::debug!(skill_id = %skill.skill_id, source = %source.name, "loaded skill");
            skills.push(skill);
        }
    }
    skills
}

pub fn load_catalog(sources: &[CatalogSource]) -> Result<Catalog> {
    let roots: Vec<PathBuf> = sources.iter().map(|s| resolve_root(&s.path)).collect();

    let mut merged: BTreeMap<String, SkillMetadata> = builtin_skills()
        .into_iter()
        .map(|s| (s.skill_id.clone(), s))
        .collect();

    for (source, root) in sources.iter().zip(&roots) {
        if !root.is_dir() {
            tracing::warn!(source = %source.name, path = %root.display(), "catalog source is not a directory");
            continue;
        }
        for skill in scan_source(source, root, &roots) {
            merged.insert(skill.skill_id.clone(), skill);
        }
    }

    let catalog = Catalog::from_skills(merged.into_values())?;
    tracing::info!(
        skills = catalog.len(),
        snapshot = %catalog.snapshot_hash,
        "catalog loaded"
    );
    Ok(catalog)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
