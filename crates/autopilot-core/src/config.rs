use crate::catalog::CatalogSource;
use crate::error::Result;
use crate::paths;
use crate::policy::RoutingPolicy;
use crate::types::Host;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Empty means `~/.skill-autopilot/state.redb`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub policy: RoutingPolicy,
    #[serde(default)]
    pub catalogs: Vec<CatalogSource>,
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Agent role → preferred host name.
    #[serde(default = "default_role_host_map")]
    pub role_host_map: BTreeMap<String, String>,
    #[serde(default)]
    pub remote_worker_endpoints: Vec<String>,
    #[serde(default = "default_auto_approve")]
    pub auto_approve_gates: bool,
}

fn default_pool_size() -> usize {
    6
}

fn default_task_timeout() -> u64 {
    180
}

fn default_auto_approve() -> bool {
    true
}

fn default_role_host_map() -> BTreeMap<String, String> {
    [
        ("orchestrator", Host::ClaudeDesktop),
        ("research", Host::ClaudeDesktop),
        ("quality", Host::CodexDesktop),
        ("delivery", Host::CodexDesktop),
    ]
    .into_iter()
    .map(|(role, host)| (role.to_string(), host.as_str().to_string()))
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            policy: RoutingPolicy::default(),
            catalogs: Vec::new(),
            worker_pool_size: default_pool_size(),
            task_timeout_secs: default_task_timeout(),
            role_host_map: default_role_host_map(),
            remote_worker_endpoints: Vec::new(),
            auto_approve_gates: default_auto_approve(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        match crate::io::read_optional(path)? {
            Some(data) => Ok(serde_yaml::from_str(&data)?),
            None => {
                let cfg = Config::default();
                cfg.save(path)?;
                tracing::info!(path = %path.display(), "wrote default config");
                Ok(cfg)
            }
        }
    }

    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(p) => Ok(paths::expand_home(p)),
            None => paths::default_db_path(),
        }
    }

    /// Role → host with unknown host names dropped.
    pub fn role_hosts(&self) -> BTreeMap<String, Host> {
        self.role_host_map
            .iter()
            .filter_map(|(role, host)| host.parse().ok().map(|h| (role.clone(), h)))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let policy = &self.policy;

        if policy.max_active_skills == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "policy.max_active_skills is 0; no skill can ever be selected".into(),
            });
        }

        if policy.max_skills_per_cluster == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "policy.max_skills_per_cluster is 0; every cluster is capped".into(),
            });
        }

        if !(0.0..=1.0).contains(&policy.utility_penalty) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "policy.utility_penalty={} is outside [0, 1]",
                    policy.utility_penalty
                ),
            });
        }

        if policy.lease_ttl_hours == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "policy.lease_ttl_hours is 0; leases expire immediately".into(),
            });
        }

        for (role, host) in &self.role_host_map {
            if host.parse::<Host>().is_err() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("unknown host '{host}' for role '{role}' in role_host_map"),
                });
            }
        }

        if self.worker_pool_size == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "worker_pool_size is 0; no task can run".into(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.catalogs {
            if !seen.insert(source.name.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("catalog source '{}' is listed twice", source.name),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_round_trip_through_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        Config::default().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.worker_pool_size, 6);
        assert_eq!(loaded.task_timeout_secs, 180);
        assert_eq!(loaded.policy, RoutingPolicy::default());
    }

    #[test]
    fn empty_yaml_gets_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.role_host_map.get("quality").unwrap(), "codex_desktop");
        assert!(cfg.auto_approve_gates);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_or_init_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.yaml");
        let cfg = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.policy.max_active_skills, 12);
    }

    #[test]
    fn validate_flags_bad_values() {
        let mut cfg = Config::default();
        cfg.policy.max_active_skills = 0;
        cfg.policy.utility_penalty = 2.0;
        cfg.role_host_map
            .insert("scribe".into(), "emacs_desktop".into());
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.level == WarnLevel::Error));
        assert!(cfg.role_hosts().get("scribe").is_none());
    }

    #[test]
    fn explicit_db_path_wins() {
        let cfg: Config = serde_yaml::from_str("db_path: /tmp/x.redb\n").unwrap();
        assert_eq!(cfg.resolved_db_path().unwrap(), PathBuf::from("/tmp/x.redb"));
    }
}
