use serde::{Deserialize, Serialize};

/// Knobs that bound a single routing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default = "default_max_active")]
    pub max_active_skills: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance_score: f64,
    #[serde(default = "default_max_utility")]
    pub max_utility_skills: usize,
    #[serde(default = "default_max_per_cluster")]
    pub max_skills_per_cluster: usize,
    #[serde(default = "default_utility_penalty")]
    pub utility_penalty: f64,
    #[serde(default = "default_preferred_sources")]
    pub preferred_sources: Vec<String>,
    #[serde(default = "default_preferred_bonus")]
    pub preferred_source_bonus: f64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_hours: u32,
    #[serde(default = "default_exclude_prefixes")]
    pub exclude_id_prefixes: Vec<String>,
    #[serde(default = "default_utility_ids")]
    pub utility_skill_ids: Vec<String>,
    #[serde(default = "default_allow_terms")]
    pub utility_allow_terms: Vec<String>,
}

fn default_max_active() -> usize {
    12
}

fn default_min_relevance() -> f64 {
    0.22
}

fn default_max_utility() -> usize {
    1
}

fn default_max_per_cluster() -> usize {
    4
}

fn default_utility_penalty() -> f64 {
    0.35
}

fn default_preferred_sources() -> Vec<String> {
    vec!["local_library".to_string()]
}

fn default_preferred_bonus() -> f64 {
    0.08
}

fn default_lease_ttl() -> u32 {
    24
}

fn default_exclude_prefixes() -> Vec<String> {
    vec![".system".to_string()]
}

fn default_utility_ids() -> Vec<String> {
    ["pdf", "playwright", "screenshot"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_allow_terms() -> Vec<String> {
    [
        "pdf",
        "screenshot",
        "image",
        "browser",
        "scrape",
        "crawl",
        "playwright",
        "web",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            max_active_skills: default_max_active(),
            min_relevance_score: default_min_relevance(),
            max_utility_skills: default_max_utility(),
            max_skills_per_cluster: default_max_per_cluster(),
            utility_penalty: default_utility_penalty(),
            preferred_sources: default_preferred_sources(),
            preferred_source_bonus: default_preferred_bonus(),
            lease_ttl_hours: default_lease_ttl(),
            exclude_id_prefixes: default_exclude_prefixes(),
            utility_skill_ids: default_utility_ids(),
            utility_allow_terms: default_allow_terms(),
        }
    }
}

impl RoutingPolicy {
    /// A skill is a utility skill when its id equals a configured entry or
    /// ends with `.<entry>`.
    pub fn is_utility(&self, skill_id: &str) -> bool {
        self.utility_skill_ids.iter().any(|entry| {
            skill_id == entry
                || skill_id
                    .strip_suffix(entry.as_str())
                    .is_some_and(|head| head.ends_with('.'))
        })
    }

    pub fn is_excluded(&self, skill_id: &str) -> bool {
        self.exclude_id_prefixes
            .iter()
            .any(|prefix| skill_id.starts_with(prefix.as_str()))
    }

    pub fn is_preferred_source(&self, source_repo: &str) -> bool {
        self.preferred_sources.iter().any(|s| s == source_repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_partial_yaml() {
        let policy: RoutingPolicy = serde_yaml::from_str("max_active_skills: 3\n").unwrap();
        assert_eq!(policy.max_active_skills, 3);
        assert_eq!(policy.max_skills_per_cluster, 4);
        assert!((policy.utility_penalty - 0.35).abs() < f64::EPSILON);
    }

    #[test]
    fn utility_matches_exact_or_dotted_suffix() {
        let policy = RoutingPolicy::default();
        assert!(policy.is_utility("pdf"));
        assert!(policy.is_utility("tools.pdf"));
        assert!(!policy.is_utility("tools.notpdf"));
        assert!(!policy.is_utility("pdf.reader"));
    }

    #[test]
    fn exclusion_is_prefix_based() {
        let policy = RoutingPolicy::default();
        assert!(policy.is_excluded(".system.installer"));
        assert!(!policy.is_excluded("core.system"));
    }
}
