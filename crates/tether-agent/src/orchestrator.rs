//! Session registry and state machine.
//!
//! Each session runs its conversation loop on a dedicated task. Control calls
//! from the host only flip fields on the session record and wake the loop's
//! wait points; the loop task is the only one that touches the sandbox while
//! it runs.

use crate::conversation::{
    self, CancelHandle, ConversationLoop, LoopOutcome, RunRequest, ToolExecutor,
};
use crate::events::emit_quietly;
use crate::redact::redact_context;
use crate::validator::{PermissionPolicy, check_tool_permission};
use crate::{
    Access, AgentError, AgentEvent, AgentOptions, AgentSession, AgentState, ContextInfo,
    EventEmitter, EventKind, OrchestratorError, PendingPermission, PermissionDecision,
    RemoteProvider, RuntimeConfig, Sandbox, SandboxLimits, SessionHistory, SnapshotStore,
    ToolCallRecord, ToolError, ToolOutput, ToolRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tether_llm::{Client, ToolCall};
use tokio::sync::{Notify, RwLock, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::Instrument;
use uuid::Uuid;

const QUOTA_WINDOW_HOURS: i64 = 24;
const DEFAULT_DENIAL_REASON: &str = "denied by user";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parameters for [`Orchestrator::start_session`].
#[derive(Clone, Debug)]
pub struct StartSession {
    pub remote_ref: String,
    pub prompt: String,
    pub context: ContextInfo,
    pub options: AgentOptions,
}

/// Handle to a running session loop. Resolves to the state the session was
/// left in once the loop and its supervisor have finished.
pub struct SessionTask {
    session_id: String,
    handle: JoinHandle<AgentState>,
}

impl SessionTask {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> AgentState {
        match self.handle.await {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(session_id = %self.session_id, %error, "session supervisor failed");
                AgentState::Failed
            }
        }
    }
}

struct SessionEntry {
    id: String,
    record: Mutex<AgentSession>,
    emitter: Arc<dyn EventEmitter>,
    state_changed: Notify,
    permission: Mutex<Option<oneshot::Sender<PermissionDecision>>>,
    cancel: CancelHandle,
    loop_active: AtomicBool,
    conversation: tokio::sync::Mutex<ConversationLoop>,
    sandbox: tokio::sync::Mutex<Sandbox>,
    task: Mutex<Option<AbortHandle>>,
}

impl SessionEntry {
    fn state(&self) -> AgentState {
        lock(&self.record).state
    }

    fn emit(&self, kind: EventKind, payload: Value) {
        emit_quietly(
            self.emitter.as_ref(),
            AgentEvent::for_session(kind, &self.id, payload),
        );
    }

    /// Moves to `next` when `allowed` accepts the current state, applying
    /// `edit` under the same lock. Returns the rejected state otherwise.
    fn transition(
        &self,
        allowed: impl FnOnce(AgentState) -> bool,
        next: AgentState,
        edit: impl FnOnce(&mut AgentSession),
    ) -> Result<AgentState, AgentState> {
        let previous = {
            let mut record = lock(&self.record);
            let previous = record.state;
            if !allowed(previous) {
                return Err(previous);
            }
            edit(&mut record);
            record.state = next;
            if next != AgentState::AwaitingPermission {
                record.pending_permission = None;
            }
            if next.is_terminal() && record.completed_at.is_none() {
                record.completed_at = Some(Utc::now());
            }
            previous
        };
        if previous != next {
            tracing::info!(session_id = %self.id, from = %previous, to = %next, "session state changed");
            self.emit(
                EventKind::StateChange,
                json!({ "from": previous, "to": next }),
            );
        }
        self.state_changed.notify_waiters();
        Ok(previous)
    }

    /// Cancels the loop, releases any permission wait and marks the session
    /// stopped. No-op for sessions that already finished.
    fn halt(&self) {
        self.cancel.cancel();
        lock(&self.permission).take();
        let _ = self.transition(|state| !state.is_terminal(), AgentState::Stopped, |_| {});
        self.state_changed.notify_waiters();
    }

    fn fail(&self, message: String) {
        tracing::error!(session_id = %self.id, error = %message, "session failed");
        let recorded = message.clone();
        let moved = self.transition(
            |state| state.can_transition_to(&AgentState::Failed),
            AgentState::Failed,
            |record| record.error = Some(recorded),
        );
        if moved.is_err() {
            lock(&self.record).error = Some(message.clone());
        }
        self.emit(EventKind::Error, json!({ "message": message, "fatal": true }));
    }

    /// Records how the loop ended. The loop is gone at this point, so any live
    /// state (including `paused`) resolves to the outcome's terminal state.
    /// `loop_active` is cleared last so `continue` cannot start a new run
    /// before this one's result is written.
    fn finish(&self, result: Result<Result<LoopOutcome, AgentError>, JoinError>) -> AgentState {
        match result {
            Ok(Ok(outcome)) => {
                let next = if outcome.success {
                    AgentState::Done
                } else if outcome.stopped {
                    AgentState::Stopped
                } else {
                    AgentState::Failed
                };
                let summary = outcome.summary.clone();
                let moved = self.transition(
                    |state| !state.is_terminal() && state != AgentState::RollingBack,
                    next,
                    |record| {
                        if next == AgentState::Failed {
                            record.error = Some(summary.clone());
                        }
                        record.summary = Some(summary);
                    },
                );
                if moved.is_err() {
                    lock(&self.record).summary = Some(outcome.summary.clone());
                }
                let state = self.state();
                self.emit(
                    EventKind::Done,
                    json!({
                        "success": state == AgentState::Done,
                        "summary": outcome.summary,
                        "iterations": outcome.iterations,
                    }),
                );
            }
            Ok(Err(error)) => self.fail(error.to_string()),
            Err(error) if error.is_cancelled() => {
                let _ = self.transition(|state| !state.is_terminal(), AgentState::Stopped, |_| {});
            }
            Err(error) => self.fail(format!("session task panicked: {error}")),
        }
        let state = self.state();
        self.loop_active.store(false, Ordering::SeqCst);
        state
    }

    /// Blocks while paused. Fails once the session is stopped.
    async fn wait_while_paused(&self, poll: Duration) -> Result<(), ToolError> {
        loop {
            let notified = self.state_changed.notified();
            let state = self.state();
            if self.cancel.is_cancelled() || state.is_terminal() {
                return Err(ToolError::Stopped);
            }
            if state != AgentState::Paused {
                return Ok(());
            }
            let _ = tokio::time::timeout(poll, notified).await;
        }
    }

    async fn await_decision(
        &self,
        mut receiver: oneshot::Receiver<PermissionDecision>,
        poll: Duration,
    ) -> Result<PermissionDecision, ToolError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(ToolError::Stopped);
            }
            match tokio::time::timeout(poll, &mut receiver).await {
                Ok(Ok(decision)) => return Ok(decision),
                Ok(Err(_)) => return Err(ToolError::Stopped),
                Err(_) => continue,
            }
        }
    }

    fn decide(
        &self,
        operation: &'static str,
        decision: PermissionDecision,
    ) -> Result<(), OrchestratorError> {
        self.transition(
            |state| state == AgentState::AwaitingPermission,
            AgentState::Running,
            |_| {},
        )
        .map_err(|state| OrchestratorError::InvalidState { operation, state })?;
        if let Some(sender) = lock(&self.permission).take() {
            if sender.send(decision).is_err() {
                tracing::debug!(session_id = %self.id, "permission decision arrived after the wait ended");
            }
        }
        Ok(())
    }
}

/// Tool executor handed to the conversation loop. Runs the pause and
/// permission handshake around every sandbox call.
struct SessionExecutor {
    entry: Arc<SessionEntry>,
    poll_interval: Duration,
}

impl SessionExecutor {
    async fn authorize(&self, request: &ToolRequest) -> Result<Access, ToolError> {
        let (options, workspace_root) = {
            let record = lock(&self.entry.record);
            (record.options, record.context.workspace_root.clone())
        };
        let policy = PermissionPolicy {
            auto_run_commands: options.auto_run_commands,
            auto_install_deps: options.auto_install_deps,
            allow_system_access: options.allow_system_access,
        };
        let check = check_tool_permission(request, &workspace_root, &policy);
        if !check.requires_permission {
            return Ok(Access::Standard);
        }

        let reason = check
            .reason
            .unwrap_or_else(|| "approval required".to_string());
        let pending = PendingPermission {
            tool: request.name().to_string(),
            args: request.summary_arguments(),
            reason,
        };
        let receiver = loop {
            self.entry.wait_while_paused(self.poll_interval).await?;
            let (sender, receiver) = oneshot::channel();
            *lock(&self.entry.permission) = Some(sender);
            let requested = pending.clone();
            match self.entry.transition(
                |state| state == AgentState::Running,
                AgentState::AwaitingPermission,
                |record| record.pending_permission = Some(requested),
            ) {
                Ok(_) => break receiver,
                Err(AgentState::Paused) => continue,
                Err(_) => {
                    lock(&self.entry.permission).take();
                    return Err(ToolError::Stopped);
                }
            }
        };
        tracing::info!(session_id = %self.entry.id, tool = %pending.tool, reason = %pending.reason, "waiting for permission");
        self.entry.emit(
            EventKind::PermissionRequired,
            json!({ "tool": pending.tool, "args": pending.args, "reason": pending.reason }),
        );

        match self.entry.await_decision(receiver, self.poll_interval).await? {
            PermissionDecision::Granted => Ok(Access::Granted),
            PermissionDecision::Denied { reason } => Err(ToolError::PermissionDenied(
                reason.unwrap_or_else(|| DEFAULT_DENIAL_REASON.to_string()),
            )),
        }
    }

    async fn run(&self, request: &ToolRequest) -> Result<ToolOutput, ToolError> {
        self.entry.wait_while_paused(self.poll_interval).await?;
        let access = self.authorize(request).await?;

        let mut sandbox = self.entry.sandbox.lock().await;
        if self.entry.cancel.is_cancelled() {
            return Err(ToolError::Stopped);
        }
        if let ToolRequest::RunCmd(args) = request {
            self.entry.emit(
                EventKind::CmdStart,
                json!({ "command": args.command, "cwd": args.cwd }),
            );
        }
        let output = sandbox.execute(request, access).await;
        let changes = sandbox.changes().to_vec();
        drop(sandbox);
        lock(&self.entry.record).file_changes = changes;

        self.announce(request, &output);
        output
    }

    fn announce(&self, request: &ToolRequest, output: &Result<ToolOutput, ToolError>) {
        match (request, output) {
            (ToolRequest::RunCmd(args), Err(error)) => self.entry.emit(
                EventKind::CmdComplete,
                json!({ "command": args.command, "error": error.to_string() }),
            ),
            (_, Err(_)) => {}
            (ToolRequest::CreateFile(_), Ok(ToolOutput::Written(outcome))) => self.entry.emit(
                EventKind::FileCreated,
                json!({ "path": outcome.path, "bytes": outcome.bytes }),
            ),
            (_, Ok(ToolOutput::Written(outcome))) => self.entry.emit(
                EventKind::EditDelta,
                json!({ "path": outcome.path, "action": outcome.action, "bytes": outcome.bytes }),
            ),
            (_, Ok(ToolOutput::Deleted { path })) => {
                self.entry.emit(EventKind::FileDeleted, json!({ "path": path }))
            }
            (_, Ok(ToolOutput::Renamed(outcome))) => self.entry.emit(
                EventKind::EditDelta,
                json!({
                    "path": outcome.new_path,
                    "old_path": outcome.old_path,
                    "action": "renamed",
                }),
            ),
            (_, Ok(ToolOutput::Command(outcome))) => self.entry.emit(
                EventKind::CmdComplete,
                json!({
                    "command": outcome.command,
                    "exit_code": outcome.exit_code,
                    "timed_out": outcome.timed_out,
                    "duration_ms": outcome.duration_ms,
                }),
            ),
            (_, Ok(_)) => {}
        }
    }
}

#[async_trait]
impl ToolExecutor for SessionExecutor {
    async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        let started = Instant::now();
        let parsed = ToolRequest::parse(&call.name, &call.arguments);
        let args = parsed
            .as_ref()
            .map(ToolRequest::summary_arguments)
            .unwrap_or_else(|_| call.arguments.clone());

        let result = match parsed {
            Ok(request) => self.run(&request).await.and_then(|output| {
                serde_json::to_value(&output)
                    .map_err(|error| ToolError::Remote(format!("unserializable tool output: {error}")))
            }),
            Err(error) => Err(error),
        };

        let (result_value, error) = match &result {
            Ok(value) => (Some(value.clone()), None),
            Err(error) => (None, Some(error.to_string())),
        };
        lock(&self.entry.record).tool_calls.push(ToolCallRecord {
            id: call.id.clone(),
            tool: call.name.clone(),
            args,
            result: result_value,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        result.map(|value| value.to_string())
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<SessionEntry>>,
    /// Session start times per remote reference, pruned to the quota window.
    starts: HashMap<String, VecDeque<DateTime<Utc>>>,
}

/// Owns every session of one host process.
pub struct Orchestrator {
    client: Arc<Client>,
    remotes: Arc<dyn RemoteProvider>,
    snapshots: Arc<dyn SnapshotStore>,
    config: Arc<RuntimeConfig>,
    registry: RwLock<Registry>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<Client>,
        remotes: Arc<dyn RemoteProvider>,
        snapshots: Arc<dyn SnapshotStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            client,
            remotes,
            snapshots,
            config: Arc::new(config),
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    async fn entry(&self, session_id: &str) -> Result<Arc<SessionEntry>, OrchestratorError> {
        self.registry
            .read()
            .await
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))
    }

    pub async fn start_session(
        &self,
        request: StartSession,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<SessionTask, OrchestratorError> {
        let StartSession {
            remote_ref,
            prompt,
            context,
            options,
        } = request;
        let channel = self
            .remotes
            .channel(&remote_ref)
            .ok_or_else(|| OrchestratorError::UnknownRemote(remote_ref.clone()))?;

        let session_id = Uuid::new_v4().to_string();
        let entry = {
            let mut guard = self.registry.write().await;
            let registry = &mut *guard;

            let active = registry
                .sessions
                .values()
                .filter(|entry| entry.state().is_active())
                .count();
            if active >= self.config.global_session_cap {
                tracing::warn!(active, limit = self.config.global_session_cap, "session rejected by global cap");
                return Err(OrchestratorError::GlobalCapReached {
                    active,
                    limit: self.config.global_session_cap,
                });
            }

            let now = Utc::now();
            let window_start = now - chrono::Duration::hours(QUOTA_WINDOW_HOURS);
            let starts = registry.starts.entry(remote_ref.clone()).or_default();
            while starts.front().is_some_and(|started| *started <= window_start) {
                starts.pop_front();
            }
            let limit = self.config.daily_quota(options.is_pro);
            if starts.len() >= limit {
                tracing::warn!(%remote_ref, used = starts.len(), limit, "session rejected by daily quota");
                return Err(OrchestratorError::QuotaExceeded {
                    remote_ref,
                    used: starts.len(),
                    limit,
                });
            }
            starts.push_back(now);

            let sandbox = Sandbox::new(
                remote_ref.clone(),
                context.workspace_root.clone(),
                channel,
                self.snapshots.clone(),
                SandboxLimits::from(self.config.as_ref()),
            )
            .with_system_access(options.allow_system_access);
            let conversation = ConversationLoop::new(self.client.clone(), self.config.clone());
            let entry = Arc::new(SessionEntry {
                id: session_id.clone(),
                record: Mutex::new(AgentSession::new(
                    session_id.clone(),
                    remote_ref.clone(),
                    prompt.clone(),
                    context.clone(),
                    options,
                )),
                emitter,
                state_changed: Notify::new(),
                permission: Mutex::new(None),
                cancel: conversation.cancel_handle(),
                loop_active: AtomicBool::new(false),
                conversation: tokio::sync::Mutex::new(conversation),
                sandbox: tokio::sync::Mutex::new(sandbox),
                task: Mutex::new(None),
            });
            registry.sessions.insert(session_id.clone(), entry.clone());
            entry
        };

        tracing::info!(%session_id, %remote_ref, "session created");
        entry.emit(
            EventKind::SessionCreated,
            json!({
                "remote_ref": remote_ref,
                "prompt": prompt,
                "context": redact_context(&context),
                "options": options,
            }),
        );
        Ok(self.spawn(entry, prompt, false))
    }

    fn spawn(&self, entry: Arc<SessionEntry>, prompt: String, is_continuation: bool) -> SessionTask {
        entry.loop_active.store(true, Ordering::SeqCst);
        let span = tracing::info_span!("session", session_id = %entry.id);
        let inner = tokio::spawn(
            run_session(entry.clone(), self.config.clone(), prompt, is_continuation).instrument(span),
        );
        *lock(&entry.task) = Some(inner.abort_handle());

        let session_id = entry.id.clone();
        let handle = tokio::spawn(async move {
            let result = inner.await;
            entry.finish(result)
        });
        SessionTask { session_id, handle }
    }

    pub async fn pause(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(session_id).await?;
        entry
            .transition(|state| state == AgentState::Running, AgentState::Paused, |_| {})
            .map_err(|state| OrchestratorError::InvalidState {
                operation: "pause",
                state,
            })?;
        Ok(())
    }

    pub async fn resume(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(session_id).await?;
        entry
            .transition(|state| state == AgentState::Paused, AgentState::Running, |_| {})
            .map_err(|state| OrchestratorError::InvalidState {
                operation: "resume",
                state,
            })?;
        Ok(())
    }

    pub async fn grant_permission(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(session_id).await?;
        entry.decide("grant permission", PermissionDecision::Granted)
    }

    pub async fn deny_permission(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let entry = self.entry(session_id).await?;
        entry.decide("deny permission", PermissionDecision::Denied { reason })
    }

    /// Always succeeds for a known session; stopping twice is harmless.
    pub async fn stop(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(session_id).await?;
        entry.halt();
        Ok(())
    }

    /// Restores every file the session changed and returns the restored paths.
    pub async fn rollback_session(&self, session_id: &str) -> Result<Vec<String>, OrchestratorError> {
        let entry = self.entry(session_id).await?;
        entry
            .transition(|state| state.is_terminal(), AgentState::RollingBack, |_| {})
            .map_err(|state| OrchestratorError::InvalidState {
                operation: "roll back",
                state,
            })?;

        let restored = entry.sandbox.lock().await.rollback_all().await;
        lock(&entry.record).file_changes.clear();
        let _ = entry.transition(
            |state| state == AgentState::RollingBack,
            AgentState::Stopped,
            |_| {},
        );
        tracing::info!(%session_id, restored = restored.len(), "rollback complete");
        entry.emit(
            EventKind::RollbackComplete,
            json!({ "restored": restored, "count": restored.len() }),
        );
        Ok(restored)
    }

    /// Runs a follow-up prompt on a finished session, keeping its conversation.
    pub async fn continue_session(
        &self,
        session_id: &str,
        prompt: impl Into<String>,
    ) -> Result<SessionTask, OrchestratorError> {
        let entry = self.entry(session_id).await?;
        if entry.loop_active.load(Ordering::SeqCst) {
            return Err(OrchestratorError::InvalidState {
                operation: "continue",
                state: entry.state(),
            });
        }
        entry
            .transition(
                |state| state.is_terminal(),
                AgentState::Planning,
                |record| {
                    record.completed_at = None;
                    record.summary = None;
                    record.error = None;
                },
            )
            .map_err(|state| OrchestratorError::InvalidState {
                operation: "continue",
                state,
            })?;
        entry.cancel.reset();
        Ok(self.spawn(entry, prompt.into(), true))
    }

    pub async fn plan_only(
        &self,
        prompt: &str,
        context: &ContextInfo,
        emitter: &dyn EventEmitter,
    ) -> Result<String, OrchestratorError> {
        let plan = conversation::plan_only(&self.client, &self.config, prompt, context).await?;
        emit_quietly(
            emitter,
            AgentEvent::new(EventKind::Plan, None, json!({ "plan": plan })),
        );
        Ok(plan)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<AgentSession, OrchestratorError> {
        let entry = self.entry(session_id).await?;
        let record = lock(&entry.record).clone();
        Ok(record)
    }

    pub async fn get_session_history(
        &self,
        session_id: &str,
    ) -> Result<SessionHistory, OrchestratorError> {
        let entry = self.entry(session_id).await?;
        let record = lock(&entry.record);
        Ok(SessionHistory {
            session_id: record.id.clone(),
            state: record.state,
            tool_calls: record.tool_calls.clone(),
            file_changes: record.file_changes.clone(),
        })
    }

    /// Stops the session if needed and forgets it.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        let entry = self
            .registry
            .write()
            .await
            .sessions
            .remove(session_id)
            .ok_or_else(|| OrchestratorError::NotFound(session_id.to_string()))?;
        entry.halt();
        if let Some(task) = lock(&entry.task).take() {
            task.abort();
        }
        tracing::info!(%session_id, "session deleted");
        Ok(())
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.registry.read().await.sessions.keys().cloned().collect()
    }
}

async fn run_session(
    entry: Arc<SessionEntry>,
    config: Arc<RuntimeConfig>,
    prompt: String,
    is_continuation: bool,
) -> Result<LoopOutcome, AgentError> {
    let _ = entry.transition(
        |state| state == AgentState::Planning,
        AgentState::Running,
        |_| {},
    );
    let (context, options) = {
        let record = lock(&entry.record);
        (record.context.clone(), record.options)
    };
    let executor = SessionExecutor {
        entry: entry.clone(),
        poll_interval: config.poll_interval,
    };

    let mut conversation = entry.conversation.lock().await;
    conversation
        .run(
            RunRequest {
                session_id: &entry.id,
                prompt: &prompt,
                context: &context,
                options: &options,
                is_continuation,
            },
            &executor,
            entry.emitter.as_ref(),
        )
        .await
}
