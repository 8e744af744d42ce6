//! Multi-turn tool-calling loop against the model service.

use crate::events::emit_quietly;
use crate::prompts::{PLAN_FALLBACK, agent_system_prompt, plan_system_prompt, render_user_turn};
use crate::redact::redact_context;
use crate::{
    AgentError, AgentEvent, AgentOptions, ContextInfo, EventEmitter, EventKind, RuntimeConfig,
    ToolError, ToolRequest, tool_definitions, truncate_tool_output,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tether_llm::{Client, Message, Request, Response, SDKError, ToolCall, ToolResult, retry_rate_limited};
use tokio::sync::Notify;

pub const MAX_ITERATIONS_SUMMARY: &str =
    "Reached the maximum number of iterations without finishing the task.";
pub const STOPPED_SUMMARY: &str = "Stopped by user";
const COMPLETED_FALLBACK: &str = "Task completed.";

/// Runs one tool call on behalf of the loop. The returned string becomes the
/// tool result shown to the model.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall) -> Result<String, ToolError>;
}

/// Cooperative cancellation shared between a loop and whoever may stop it.
#[derive(Clone, Default)]
pub struct CancelHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Resolves once [`CancelHandle::cancel`] has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopOutcome {
    pub success: bool,
    pub summary: String,
    pub iterations: usize,
    pub stopped: bool,
}

impl LoopOutcome {
    fn completed(summary: String, iterations: usize) -> Self {
        Self {
            success: true,
            summary,
            iterations,
            stopped: false,
        }
    }

    fn stopped(iterations: usize) -> Self {
        Self {
            success: false,
            summary: STOPPED_SUMMARY.to_string(),
            iterations,
            stopped: true,
        }
    }

    fn exhausted(iterations: usize) -> Self {
        Self {
            success: false,
            summary: MAX_ITERATIONS_SUMMARY.to_string(),
            iterations,
            stopped: false,
        }
    }
}

pub struct RunRequest<'a> {
    pub session_id: &'a str,
    pub prompt: &'a str,
    pub context: &'a ContextInfo,
    pub options: &'a AgentOptions,
    pub is_continuation: bool,
}

pub struct ConversationLoop {
    client: Arc<Client>,
    config: Arc<RuntimeConfig>,
    history: Vec<Message>,
    cancel: CancelHandle,
}

impl ConversationLoop {
    pub fn new(client: Arc<Client>, config: Arc<RuntimeConfig>) -> Self {
        Self {
            client,
            config,
            history: Vec::new(),
            cancel: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub async fn run(
        &mut self,
        request: RunRequest<'_>,
        executor: &dyn ToolExecutor,
        emitter: &dyn EventEmitter,
    ) -> Result<LoopOutcome, AgentError> {
        let session_id = request.session_id;
        let context = redact_context(request.context);
        let user_turn = render_user_turn(request.prompt, &context);
        if !request.is_continuation {
            self.history.clear();
        }
        self.history.push(Message::user(user_turn));

        let system = agent_system_prompt(request.options, &context);
        let tools = tool_definitions();

        for iteration in 1..=self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return Ok(LoopOutcome::stopped(iteration - 1));
            }

            let model_request = Request {
                model: self.config.model.clone(),
                system: Some(system.clone()),
                messages: self.history.clone(),
                tools: Some(tools.clone()),
                max_tokens: Some(self.config.max_tokens),
                provider: None,
            };
            let Some(response) = self.converse(model_request).await? else {
                return Ok(LoopOutcome::stopped(iteration - 1));
            };
            let message = response.message;
            self.history.push(message.clone());

            for text in message.text_segments() {
                if !text.trim().is_empty() {
                    emit_quietly(
                        emitter,
                        AgentEvent::for_session(
                            EventKind::AgentText,
                            session_id,
                            json!({ "text": text, "iteration": iteration }),
                        ),
                    );
                }
            }

            let calls = message.tool_calls();
            if calls.is_empty() {
                let summary = message.text().trim().to_string();
                let summary = if summary.is_empty() {
                    COMPLETED_FALLBACK.to_string()
                } else {
                    summary
                };
                return Ok(LoopOutcome::completed(summary, iteration));
            }

            let mut results = Vec::with_capacity(calls.len());
            for (index, call) in calls.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    results.extend(calls[index..].iter().map(|call| ToolResult {
                        tool_call_id: call.id.clone(),
                        content: STOPPED_SUMMARY.to_string(),
                        is_error: true,
                    }));
                    self.history.push(Message::tool_results(results));
                    return Ok(LoopOutcome::stopped(iteration));
                }
                results.push(self.dispatch(session_id, call, executor, emitter).await);
            }
            self.history.push(Message::tool_results(results));
        }

        tracing::info!(%session_id, max_iterations = self.config.max_iterations, "iteration budget exhausted");
        Ok(LoopOutcome::exhausted(self.config.max_iterations))
    }

    async fn dispatch(
        &self,
        session_id: &str,
        call: &ToolCall,
        executor: &dyn ToolExecutor,
        emitter: &dyn EventEmitter,
    ) -> ToolResult {
        let args = ToolRequest::parse(&call.name, &call.arguments)
            .map(|request| request.summary_arguments())
            .unwrap_or_else(|_| call.arguments.clone());
        emit_quietly(
            emitter,
            AgentEvent::for_session(
                EventKind::ToolStart,
                session_id,
                json!({ "id": call.id, "tool": call.name, "args": args }),
            ),
        );

        let started = Instant::now();
        let result = executor.execute(call).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(output) => {
                let content = truncate_tool_output(&output, self.config.tool_output_limit);
                emit_quietly(
                    emitter,
                    AgentEvent::for_session(
                        EventKind::ToolComplete,
                        session_id,
                        json!({
                            "id": call.id,
                            "tool": call.name,
                            "duration_ms": duration_ms,
                            "result": parse_or_string(&content),
                        }),
                    ),
                );
                ToolResult {
                    tool_call_id: call.id.clone(),
                    content,
                    is_error: false,
                }
            }
            Err(error) => {
                tracing::debug!(%session_id, tool = %call.name, %error, "tool call failed");
                emit_quietly(
                    emitter,
                    AgentEvent::for_session(
                        EventKind::ToolError,
                        session_id,
                        json!({
                            "id": call.id,
                            "tool": call.name,
                            "duration_ms": duration_ms,
                            "error": error.to_string(),
                        }),
                    ),
                );
                ToolResult {
                    tool_call_id: call.id.clone(),
                    content: format!("Error: {error}"),
                    is_error: true,
                }
            }
        }
    }

    /// `Ok(None)` when cancelled while waiting on the model.
    async fn converse(&self, request: Request) -> Result<Option<Response>, AgentError> {
        let call = complete_with_policy(&self.client, &self.config, request);
        tokio::pin!(call);
        tokio::select! {
            result = &mut call => Ok(Some(result?)),
            _ = self.cancel.cancelled() => Ok(None),
        }
    }

    /// Single tool-free request with the planning instruction.
    pub async fn plan_only(&self, prompt: &str, context: &ContextInfo) -> Result<String, AgentError> {
        plan_only(&self.client, &self.config, prompt, context).await
    }
}

pub async fn plan_only(
    client: &Arc<Client>,
    config: &RuntimeConfig,
    prompt: &str,
    context: &ContextInfo,
) -> Result<String, AgentError> {
    let context = redact_context(context);
    let request = Request {
        model: config.model.clone(),
        system: Some(plan_system_prompt().to_string()),
        messages: vec![Message::user(render_user_turn(prompt, &context))],
        tools: None,
        max_tokens: Some(config.plan_max_tokens),
        provider: None,
    };
    let response = complete_with_policy(client, config, request).await?;
    let text = response.text().trim().to_string();
    if text.is_empty() {
        Ok(PLAN_FALLBACK.to_string())
    } else {
        Ok(text)
    }
}

/// One model call with the configured timeout, retried on rate limits only.
async fn complete_with_policy(
    client: &Arc<Client>,
    config: &RuntimeConfig,
    request: Request,
) -> Result<Response, SDKError> {
    let timeout = config.model_timeout;
    retry_rate_limited(&config.retry, || {
        let client = client.clone();
        let request = request.clone();
        async move {
            match tokio::time::timeout(timeout, client.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(SDKError::Timeout(timeout)),
            }
        }
    })
    .await
}

fn parse_or_string(content: &str) -> Value {
    serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()))
}
