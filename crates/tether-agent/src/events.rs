use crate::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionCreated,
    StateChange,
    Plan,
    AgentText,
    ToolStart,
    ToolComplete,
    ToolError,
    EditDelta,
    FileCreated,
    FileDeleted,
    CmdStart,
    CmdComplete,
    PermissionRequired,
    Done,
    Error,
    RollbackComplete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::StateChange => "state_change",
            Self::Plan => "plan",
            Self::AgentText => "agent_text",
            Self::ToolStart => "tool_start",
            Self::ToolComplete => "tool_complete",
            Self::ToolError => "tool_error",
            Self::EditDelta => "edit_delta",
            Self::FileCreated => "file_created",
            Self::FileDeleted => "file_deleted",
            Self::CmdStart => "cmd_start",
            Self::CmdComplete => "cmd_complete",
            Self::PermissionRequired => "permission_required",
            Self::Done => "done",
            Self::Error => "error",
            Self::RollbackComplete => "rollback_complete",
        }
    }
}

/// One item of the event stream. `session_id` is absent only for plan-only
/// requests, which run outside any session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub session_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(kind: EventKind, session_id: Option<&str>, payload: Value) -> Self {
        Self {
            kind,
            session_id: session_id.map(str::to_string),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn for_session(kind: EventKind, session_id: &str, payload: Value) -> Self {
        Self::new(kind, Some(session_id), payload)
    }
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: AgentEvent) -> Result<(), AgentError>;
}

#[derive(Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: AgentEvent) -> Result<(), AgentError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BufferedEventEmitter {
    inner: Arc<Mutex<Vec<AgentEvent>>>,
}

impl BufferedEventEmitter {
    pub fn snapshot(&self) -> Vec<AgentEvent> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.snapshot().iter().map(|event| event.kind).collect()
    }
}

impl EventEmitter for BufferedEventEmitter {
    fn emit(&self, event: AgentEvent) -> Result<(), AgentError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| AgentError::Event("buffered emitter mutex poisoned".to_string()))?;
        guard.push(event);
        Ok(())
    }
}

/// Forwards events to an unbounded channel so a consumer task can relay them
/// to a user interface.
#[derive(Clone)]
pub struct ChannelEventEmitter {
    sender: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelEventEmitter {
    pub fn new(sender: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { sender }
    }
}

impl EventEmitter for ChannelEventEmitter {
    fn emit(&self, event: AgentEvent) -> Result<(), AgentError> {
        self.sender
            .send(event)
            .map_err(|_| AgentError::Event("event receiver dropped".to_string()))
    }
}

pub fn event_channel() -> (ChannelEventEmitter, mpsc::UnboundedReceiver<AgentEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelEventEmitter::new(sender), receiver)
}

/// Emits and logs delivery failures instead of propagating them. A consumer
/// going away must not fail the session that produced the event.
pub(crate) fn emit_quietly(emitter: &dyn EventEmitter, event: AgentEvent) {
    let kind = event.kind;
    if let Err(error) = emitter.emit(event) {
        tracing::debug!(event = kind.as_str(), %error, "event not delivered");
    }
}
