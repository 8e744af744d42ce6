use crate::session::AgentState;
use thiserror::Error;

/// Infrastructure failures. Fatal to the session that hits them.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unknown remote session: {0}")]
    UnknownRemote(String),
    #[error("remote channel error: {0}")]
    Remote(String),
    #[error("event delivery failed: {0}")]
    Event(String),
    #[error(transparent)]
    Llm(#[from] tether_llm::SDKError),
}

/// Failures of a single tool call. These are fed back to the model as tool
/// results instead of ending the session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    Validation(String),
    #[error(transparent)]
    Path(#[from] PathViolation),
    #[error(transparent)]
    Command(#[from] CommandViolation),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("session was stopped")]
    Stopped,
    #[error("{0}")]
    Limit(String),
    #[error("remote operation failed: {0}")]
    Remote(String),
}

impl From<AgentError> for ToolError {
    fn from(error: AgentError) -> Self {
        ToolError::Remote(error.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathViolation {
    #[error("path is empty")]
    Empty,
    #[error("path must be absolute: {0}")]
    NotAbsolute(String),
    #[error("path contains a null byte")]
    NullByte,
    #[error("path contains a '..' segment: {0}")]
    Traversal(String),
    #[error("path {path} is outside the workspace {workspace_root}; system access is required")]
    NeedsElevation { path: String, workspace_root: String },
}

impl PathViolation {
    pub fn needs_elevation(&self) -> bool {
        matches!(self, Self::NeedsElevation { .. })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandViolation {
    #[error("command is empty")]
    Empty,
    #[error("command exceeds {limit} bytes")]
    TooLong { limit: usize },
    #[error("command is blocked: {reason}")]
    HardDenied { reason: &'static str },
    #[error("command could not be parsed: {0}")]
    Unparseable(String),
    #[error("'{executable}' is not in the allowed command list; system access is required")]
    NeedsElevation { executable: String },
}

impl CommandViolation {
    pub fn needs_elevation(&self) -> bool {
        matches!(self, Self::NeedsElevation { .. })
    }
}

/// Rejections from the orchestrator's control surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown remote session: {0}")]
    UnknownRemote(String),
    #[error("too many active sessions ({active}/{limit})")]
    GlobalCapReached { active: usize, limit: usize },
    #[error("daily session quota reached for {remote_ref} ({used}/{limit} in the last 24h)")]
    QuotaExceeded {
        remote_ref: String,
        used: usize,
        limit: usize,
    },
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: AgentState,
    },
    #[error(transparent)]
    Agent(#[from] AgentError),
}
