use thiserror::Error;

/// Longest error message kept in the task-run log.
pub const MAX_ERROR_LEN: usize = 2000;

#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error("project brief is empty")]
    BriefEmpty,

    #[error("project brief is too short to route reliably ({len} chars, need at least 40)")]
    BriefTooShort { len: usize },

    #[error("brief not readable at {path}: {reason}")]
    BriefUnreadable { path: String, reason: String },

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("no run found for project: {0}")]
    RunNotFound(String),

    #[error("task not found in plan: {0}")]
    TaskNotFound(String),

    #[error("gate not found in plan: {0}")]
    GateNotFound(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("project {project_id} is not executable in state {state}")]
    ProjectNotExecutable { project_id: String, state: String },

    #[error("task {task_id} failed on {host}: {message}")]
    Execution {
        task_id: String,
        host: String,
        message: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl AutopilotError {
    /// True for failures the caller fixes by changing its input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AutopilotError::BriefEmpty
                | AutopilotError::BriefTooShort { .. }
                | AutopilotError::BriefUnreadable { .. }
                | AutopilotError::UnknownHost(_)
                | AutopilotError::InvalidPhase(_)
                | AutopilotError::InvalidConfig(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AutopilotError::ProjectNotFound(_)
                | AutopilotError::PlanNotFound(_)
                | AutopilotError::RunNotFound(_)
                | AutopilotError::TaskNotFound(_)
                | AutopilotError::GateNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AutopilotError>;

/// Cut `message` to at most [`MAX_ERROR_LEN`] bytes on a char boundary.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
