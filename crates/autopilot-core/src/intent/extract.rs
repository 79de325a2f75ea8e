//! Goal / constraint / deliverable extraction from markdown-ish brief text.
//!
//! Tiers, tried in order per list:
//! 1. bullets under a recognized section heading
//! 2. leading bullets of the whole brief (goals only)
//! 3. sentence candidates from the whole brief
//! 4. keyword-cued lines (constraints and deliverables only)

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Goals fall back to this many leading bullets of the whole brief.
pub const GOAL_FALLBACK_LIMIT: usize = 5;
pub const CANDIDATE_LIMIT: usize = 5;
pub const CUED_LIMIT: usize = 6;
pub const MIN_FRAGMENT_CHARS: usize = 12;

// ---------------------------------------------------------------------------
// Regexes
// ---------------------------------------------------------------------------

static GOALS_RE: OnceLock<Regex> = OnceLock::new();
static CONSTRAINTS_RE: OnceLock<Regex> = OnceLock::new();
static DELIVERABLES_RE: OnceLock<Regex> = OnceLock::new();
static NUMBERED_RE: OnceLock<Regex> = OnceLock::new();
static TOC_RE: OnceLock<Regex> = OnceLock::new();
static VERSION_RE: OnceLock<Regex> = OnceLock::new();
static TABLE_RULE_RE: OnceLock<Regex> = OnceLock::new();
static CONSTRAINT_CUE_RE: OnceLock<Regex> = OnceLock::new();
static DELIVERABLE_CUE_RE: OnceLock<Regex> = OnceLock::new();

fn goals_re() -> &'static Regex {
    GOALS_RE.get_or_init(|| Regex::new(r"(?i)^#+\s*(goals?|objectives?|outcomes?)").unwrap())
}

fn constraints_re() -> &'static Regex {
    CONSTRAINTS_RE
        .get_or_init(|| Regex::new(r"(?i)^#+\s*(constraints?|limits?|boundaries?)").unwrap())
}

fn deliverables_re() -> &'static Regex {
    DELIVERABLES_RE
        .get_or_init(|| Regex::new(r"(?i)^#+\s*(deliverables?|outputs?|artifacts?)").unwrap())
}

fn numbered_re() -> &'static Regex {
    NUMBERED_RE.get_or_init(|| Regex::new(r"^\d+\.\s+").unwrap())
}

fn toc_re() -> &'static Regex {
    TOC_RE.get_or_init(|| {
        Regex::new(r"^(?:[-*]\s+|\d+\.\s+)?\[[^\]]*\]\(#[^)]*\)\s*$").unwrap()
    })
}

fn version_re() -> &'static Regex {
    VERSION_RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:[-*]\s+)?(?:version\b|v\d+(?:\.\d+)+|(?:last\s+)?(?:updated|revised|date)\s*:|\d{4}-\d{2}-\d{2}\b)",
        )
        .unwrap()
    })
}

fn table_rule_re() -> &'static Regex {
    TABLE_RULE_RE.get_or_init(|| Regex::new(r"^[\s|:\-]*-{3,}[\s|:\-]*$").unwrap())
}

fn constraint_cue_re() -> &'static Regex {
    CONSTRAINT_CUE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(must|should|shall|required?|requires|limit(s|ed)?|cannot|can't|no more than|at most|budget|deadline|comply)\b",
        )
        .unwrap()
    })
}

fn deliverable_cue_re() -> &'static Regex {
    DELIVERABLE_CUE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(deliverables?|artifacts?|reports?|services?|dashboards?|apis?|documentation|runbooks?|handoff)\b",
        )
        .unwrap()
    })
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Goals,
    Constraints,
    Deliverables,
}

#[derive(Debug, Default)]
pub struct SectionBody {
    pub present: bool,
    pub lines: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Sections {
    pub goals: SectionBody,
    pub constraints: SectionBody,
    pub deliverables: SectionBody,
}

impl Sections {
    fn body_mut(&mut self, section: Section) -> &mut SectionBody {
        match section {
            Section::Goals => &mut self.goals,
            Section::Constraints => &mut self.constraints,
            Section::Deliverables => &mut self.deliverables,
        }
    }
}

pub fn match_header(line: &str) -> Option<Section> {
    if goals_re().is_match(line) {
        Some(Section::Goals)
    } else if constraints_re().is_match(line) {
        Some(Section::Constraints)
    } else if deliverables_re().is_match(line) {
        Some(Section::Deliverables)
    } else {
        None
    }
}

/// Group non-empty lines under the recognized heading they follow. Any other
/// heading closes the current section.
pub fn collect_sections(text: &str) -> Sections {
    let mut sections = Sections::default();
    let mut current: Option<Section> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if let Some(section) = match_header(stripped) {
            sections.body_mut(section).present = true;
            current = Some(section);
            continue;
        }
        if stripped.starts_with('#') {
            current = None;
            continue;
        }
        if let Some(section) = current {
            if !stripped.is_empty() {
                sections.body_mut(section).lines.push(stripped.to_string());
            }
        }
    }

    sections
}

// ---------------------------------------------------------------------------
// Bullets
// ---------------------------------------------------------------------------

/// Text after a `- `, `* ` or `N. ` marker, if the line is a bullet.
pub fn strip_bullet(line: &str) -> Option<&str> {
    let stripped = line.trim();
    if let Some(rest) = stripped
        .strip_prefix("- ")
        .or_else(|| stripped.strip_prefix("* "))
    {
        return Some(rest.trim());
    }
    numbered_re()
        .find(stripped)
        .map(|m| stripped[m.end()..].trim())
}

pub fn extract_bullets<'a, I>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .filter_map(strip_bullet)
        .filter(|b| !b.is_empty())
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Candidate extraction
// ---------------------------------------------------------------------------

fn is_table_row(line: &str) -> bool {
    line.starts_with('|') || table_rule_re().is_match(line)
}

/// Headings, table rows, TOC links, and version/date stamps carry no intent.
pub fn is_noise(line: &str) -> bool {
    let stripped = line.trim();
    stripped.starts_with('#')
        || is_table_row(stripped)
        || toc_re().is_match(stripped)
        || version_re().is_match(stripped)
}

/// Split on `.`, `!` or `?` followed by whitespace.
pub fn split_sentences(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = line.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            if let Some(&(next_idx, next)) = chars.peek() {
                if next.is_whitespace() {
                    out.push(&line[start..idx + ch.len_utf8()]);
                    start = next_idx;
                }
            }
        }
    }
    out.push(&line[start..]);
    out.into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

struct Dedup {
    seen: HashSet<String>,
    items: Vec<String>,
    limit: usize,
}

impl Dedup {
    fn new(limit: usize) -> Self {
        Self {
            seen: HashSet::new(),
            items: Vec::new(),
            limit,
        }
    }

    fn full(&self) -> bool {
        self.items.len() >= self.limit
    }

    fn push(&mut self, item: &str) {
        if !self.full() && self.seen.insert(item.to_lowercase()) {
            self.items.push(item.to_string());
        }
    }
}

/// Sentence fragments of at least [`MIN_FRAGMENT_CHARS`] from non-noise lines.
pub fn candidate_items<'a, I>(lines: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = Dedup::new(limit);
    for line in lines {
        if out.full() {
            break;
        }
        if is_noise(line) {
            continue;
        }
        let body = strip_bullet(line).unwrap_or(line.trim());
        for fragment in split_sentences(body) {
            if fragment.chars().count() >= MIN_FRAGMENT_CHARS {
                out.push(fragment);
            }
        }
    }
    out.items
}

/// Lines of the whole brief that carry a domain cue word.
pub fn keyword_cued(text: &str, cue: &Regex, limit: usize) -> Vec<String> {
    let mut out = Dedup::new(limit);
    for line in text.lines() {
        if out.full() {
            break;
        }
        if is_noise(line) {
            continue;
        }
        let body = strip_bullet(line).unwrap_or(line.trim());
        if body.chars().count() >= MIN_FRAGMENT_CHARS && cue.is_match(body) {
            out.push(body);
        }
    }
    out.items
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq)]
pub struct ExtractedItems {
    pub goals: Vec<String>,
    pub constraints: Vec<String>,
    pub deliverables: Vec<String>,
}

fn section_bullets(body: &SectionBody) -> Vec<String> {
    extract_bullets(body.lines.iter().map(String::as_str))
}

/// Section bullets, then whole-brief candidates, then cue-word lines.
fn cued_items(text: &str, body: &SectionBody, cue: &Regex) -> Vec<String> {
    let mut items = section_bullets(body);
    if items.is_empty() {
        items = candidate_items(text.lines(), CANDIDATE_LIMIT);
    }
    if items.is_empty() {
        items = keyword_cued(text, cue, CUED_LIMIT);
    }
    items
}

pub fn extract_items(text: &str) -> ExtractedItems {
    let sections = collect_sections(text);

    let mut goals = section_bullets(&sections.goals);
    if goals.is_empty() {
        goals = extract_bullets(text.lines());
        goals.truncate(GOAL_FALLBACK_LIMIT);
    }
    if goals.is_empty() {
        goals = candidate_items(text.lines(), CANDIDATE_LIMIT);
    }

    let constraints = cued_items(text, &sections.constraints, constraint_cue_re());
    let deliverables = cued_items(text, &sections.deliverables, deliverable_cue_re());

    ExtractedItems {
        goals,
        constraints,
        deliverables,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
