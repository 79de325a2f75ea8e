use crate::error::AutopilotError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Agent hosts a skill can be activated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Host {
    ClaudeDesktop,
    CodexDesktop,
}

impl Host {
    pub fn all() -> &'static [Host] {
        &[Host::ClaudeDesktop, Host::CodexDesktop]
    }

    /// Host assumed when a skill declares none (or only unknown ones).
    pub fn baseline() -> Host {
        Host::ClaudeDesktop
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Host::ClaudeDesktop => "claude_desktop",
            Host::CodexDesktop => "codex_desktop",
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Host {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "claude_desktop" => Ok(Host::ClaudeDesktop),
            "codex_desktop" => Ok(Host::CodexDesktop),
            other => Err(AutopilotError::UnknownHost(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Build,
    Verify,
    Ship,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[Phase::Discovery, Phase::Build, Phase::Verify, Phase::Ship]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<Phase> {
        Phase::all().get(self.index() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Discovery => "discovery",
            Phase::Build => "build",
            Phase::Verify => "verify",
            Phase::Ship => "ship",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Phase::Discovery => "Discovery",
            Phase::Build => "Build",
            Phase::Verify => "Verify",
            Phase::Ship => "Ship",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(Phase::Discovery),
            "build" => Ok(Phase::Build),
            "verify" => Ok(Phase::Verify),
            "ship" => Ok(Phase::Ship),
            _ => Err(AutopilotError::InvalidPhase(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// RiskTier / EvidenceLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceLevel {
    Standard,
    Strict,
}

impl fmt::Display for EvidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EvidenceLevel::Standard => "standard",
            EvidenceLevel::Strict => "strict",
        })
    }
}

// ---------------------------------------------------------------------------
// ProjectType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    NewBuild,
    Migration,
    Integration,
    Refactor,
    Automation,
    Analysis,
    General,
}

impl ProjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectType::NewBuild => "new_build",
            ProjectType::Migration => "migration",
            ProjectType::Integration => "integration",
            ProjectType::Refactor => "refactor",
            ProjectType::Automation => "automation",
            ProjectType::Analysis => "analysis",
            ProjectType::General => "general",
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskRunStatus
// ---------------------------------------------------------------------------

/// Terminal outcome recorded in the task-run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Completed,
    Skipped,
    Failed,
}

impl TaskRunStatus {
    /// Completed and skipped tasks count as done; failed ones stay pending.
    pub fn is_done(self) -> bool {
        matches!(self, TaskRunStatus::Completed | TaskRunStatus::Skipped)
    }
}

impl fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskRunStatus::Completed => "completed",
            TaskRunStatus::Skipped => "skipped",
            TaskRunStatus::Failed => "failed",
        })
    }
}

// ---------------------------------------------------------------------------
// ProjectState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Idle,
    Active,
    Closing,
    Closed,
    Error,
}

impl ProjectState {
    pub fn is_executable(self) -> bool {
        matches!(self, ProjectState::Active | ProjectState::Closing)
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProjectState::Idle => "idle",
            ProjectState::Active => "active",
            ProjectState::Closing => "closing",
            ProjectState::Closed => "closed",
            ProjectState::Error => "error",
        })
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Blocked,
    Completed,
    Failed,
    Terminated,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Terminated
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "running",
            RunStatus::Blocked => "blocked",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Terminated => "terminated",
        })
    }
}

// ---------------------------------------------------------------------------
// LeaseStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Closed,
    Expired,
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LeaseStatus::Active => "active",
            LeaseStatus::Closed => "closed",
            LeaseStatus::Expired => "expired",
        })
    }
}

// ---------------------------------------------------------------------------
// EndReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Paused,
    Cancelled,
    TtlExpiry,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndReason::Completed => "completed",
            EndReason::Paused => "paused",
            EndReason::Cancelled => "cancelled",
            EndReason::TtlExpiry => "ttl_expiry",
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn phase_ordering_and_next() {
        assert!(Phase::Discovery < Phase::Build);
        assert_eq!(Phase::Build.next(), Some(Phase::Verify));
        assert_eq!(Phase::Ship.next(), None);
    }

    #[test]
    fn phase_from_str() {
        for phase in Phase::all() {
            assert_eq!(Phase::from_str(phase.as_str()).unwrap(), *phase);
        }
        assert!(Phase::from_str("deploy").is_err());
    }

    #[test]
    fn host_parsing_rejects_unknown() {
        assert_eq!(Host::from_str("codex_desktop").unwrap(), Host::CodexDesktop);
        assert!(matches!(
            Host::from_str("vim"),
            Err(AutopilotError::UnknownHost(_))
        ));
    }

    #[test]
    fn failed_is_not_done() {
        assert!(TaskRunStatus::Completed.is_done());
        assert!(TaskRunStatus::Skipped.is_done());
        assert!(!TaskRunStatus::Failed.is_done());
    }

    #[test]
    fn project_type_serializes_snake_case() {
        let json = serde_json::to_string(&ProjectType::NewBuild).unwrap();
        assert_eq!(json, "\"new_build\"");
    }
}
