use crate::SnapshotRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Planning,
    Running,
    AwaitingPermission,
    Paused,
    Done,
    Failed,
    Stopped,
    RollingBack,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Running => "running",
            Self::AwaitingPermission => "awaiting_permission",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::RollingBack => "rolling_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Stopped)
    }

    /// Counted against the global concurrency cap.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Planning | Self::Running)
    }

    pub fn can_transition_to(&self, next: &AgentState) -> bool {
        use AgentState::*;

        if *next == Stopped {
            return true;
        }
        match self {
            Planning => matches!(next, Running | Failed),
            Running => matches!(next, Paused | AwaitingPermission | Done | Failed),
            Paused => matches!(next, Running | Done | Failed),
            AwaitingPermission => matches!(next, Running | Failed),
            Done | Failed | Stopped => matches!(next, RollingBack | Planning),
            RollingBack => false,
        }
    }
}

impl Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOptions {
    pub auto_run_commands: bool,
    pub auto_fix_failures: bool,
    pub auto_install_deps: bool,
    pub is_pro: bool,
    /// Runs every sandbox call elevated. Hard-denied commands stay denied.
    #[serde(default)]
    pub allow_system_access: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub workspace_root: String,
    #[serde(default)]
    pub current_file: Option<String>,
    #[serde(default)]
    pub selection: Option<String>,
    #[serde(default)]
    pub folder_path: Option<String>,
    #[serde(default)]
    pub whole_repo: bool,
}

impl ContextInfo {
    pub fn new(workspace_root: impl Into<String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Created,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub snapshot: Option<SnapshotRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool: String,
    pub args: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingPermission {
    pub tool: String,
    pub args: Value,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionDecision {
    Granted,
    Denied { reason: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: String,
    pub remote_ref: String,
    pub state: AgentState,
    pub prompt: String,
    pub context: ContextInfo,
    pub options: AgentOptions,
    pub tool_calls: Vec<ToolCallRecord>,
    pub file_changes: Vec<FileChange>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub pending_permission: Option<PendingPermission>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    pub fn new(
        id: impl Into<String>,
        remote_ref: impl Into<String>,
        prompt: impl Into<String>,
        context: ContextInfo,
        options: AgentOptions,
    ) -> Self {
        Self {
            id: id.into(),
            remote_ref: remote_ref.into(),
            state: AgentState::Planning,
            prompt: prompt.into(),
            context,
            options,
            tool_calls: Vec::new(),
            file_changes: Vec::new(),
            summary: None,
            error: None,
            pending_permission: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionHistory {
    pub session_id: String,
    pub state: AgentState,
    pub tool_calls: Vec<ToolCallRecord>,
    pub file_changes: Vec<FileChange>,
}
