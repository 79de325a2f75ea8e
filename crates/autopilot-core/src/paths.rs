use crate::error::{AutopilotError, Result};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STATE_DIR: &str = ".skill-autopilot";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DB_FILE: &str = "state.redb";
pub const BRIEF_FILE: &str = "project_brief.md";
pub const SKILL_FILE: &str = "SKILL.md";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `~/.skill-autopilot`
pub fn state_dir() -> Result<PathBuf> {
    let home = home::home_dir()
        .ok_or_else(|| AutopilotError::InvalidConfig("home directory not found".into()))?;
    Ok(home.join(STATE_DIR))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(state_dir()?.join(CONFIG_FILE))
}

pub fn default_db_path() -> Result<PathBuf> {
    Ok(state_dir()?.join(DB_FILE))
}

/// Where a workspace keeps its brief.
pub fn brief_path(workspace: &Path) -> PathBuf {
    workspace.join(BRIEF_FILE)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brief_path_joins_workspace() {
        assert_eq!(
            brief_path(Path::new("/tmp/ws")),
            PathBuf::from("/tmp/ws/project_brief.md")
        );
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home(Path::new("/etc/x")), PathBuf::from("/etc/x"));
    }
}
