#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tether_agent::{
    AgentEvent, AgentOptions, AgentSession, AgentState, BufferedEventEmitter, ContextInfo,
    EventKind, InMemorySnapshotStore, LocalRemoteChannel, Orchestrator, OrchestratorError,
    RemoteChannel, RemoteRegistry, RuntimeConfig, SessionTask, StartSession,
};
use tether_llm::{
    Client, ContentPart, Message, ProviderAdapter, Request, Response, RetryPolicy, Role, SDKError,
    Usage,
};

pub const REMOTE: &str = "local";
pub const OTHER_REMOTE: &str = "other";

/// Replays queued responses in order. With `hang_when_empty` an exhausted
/// queue blocks forever instead of failing, which keeps sessions running.
/// With a `gate` every call is recorded, then waits for a permit before it
/// answers.
#[derive(Clone, Default)]
pub struct SequenceAdapter {
    pub responses: Arc<Mutex<VecDeque<Response>>>,
    pub requests: Arc<Mutex<Vec<Request>>>,
    pub hang_when_empty: bool,
    pub gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl ProviderAdapter for SequenceAdapter {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn complete(&self, request: Request) -> Result<Response, SDKError> {
        self.requests.lock().expect("requests mutex").push(request);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate stays open").forget();
        }
        let next = self.responses.lock().expect("responses mutex").pop_front();
        match next {
            Some(response) => Ok(response),
            None if self.hang_when_empty => {
                std::future::pending::<()>().await;
                Err(SDKError::InvalidResponse("unreachable".to_string()))
            }
            None => Err(SDKError::InvalidResponse("no response queued".to_string())),
        }
    }
}

fn response(parts: Vec<ContentPart>) -> Response {
    Response {
        id: "resp".to_string(),
        model: "test-model".to_string(),
        provider: "sequence".to_string(),
        message: Message {
            role: Role::Assistant,
            content: parts,
        },
        stop_reason: None,
        usage: Usage::default(),
    }
}

pub fn text_response(text: &str) -> Response {
    response(vec![ContentPart::Text {
        text: text.to_string(),
    }])
}

pub fn tool_call_response(calls: Vec<(&str, &str, Value)>) -> Response {
    response(
        calls
            .into_iter()
            .map(|(id, name, input)| ContentPart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            })
            .collect(),
    )
}

pub fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        retry: RetryPolicy::none(),
        poll_interval: Duration::from_millis(20),
        ..RuntimeConfig::default()
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub orchestrator: Orchestrator,
    pub adapter: SequenceAdapter,
    pub emitter: BufferedEventEmitter,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(fast_config(), SequenceAdapter::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::build(config, SequenceAdapter::default())
    }

    /// Sessions stay in `running` until stopped once the queue is drained.
    pub fn hanging(config: RuntimeConfig) -> Self {
        let adapter = SequenceAdapter {
            hang_when_empty: true,
            ..SequenceAdapter::default()
        };
        Self::build(config, adapter)
    }

    /// Model calls block until [`Fixture::release`] hands out a permit.
    pub fn gated(config: RuntimeConfig) -> Self {
        let adapter = SequenceAdapter {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..SequenceAdapter::default()
        };
        Self::build(config, adapter)
    }

    fn build(config: RuntimeConfig, adapter: SequenceAdapter) -> Self {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let channel: Arc<dyn RemoteChannel> = Arc::new(LocalRemoteChannel::new());
        let remotes = Arc::new(
            RemoteRegistry::default()
                .with_channel(REMOTE, channel.clone())
                .with_channel(OTHER_REMOTE, channel),
        );
        let snapshots = Arc::new(InMemorySnapshotStore::new(remotes.clone()));
        let client = Arc::new(Client::with_provider(Arc::new(adapter.clone())));
        Self {
            dir,
            orchestrator: Orchestrator::new(client, remotes, snapshots, config),
            adapter,
            emitter: BufferedEventEmitter::default(),
        }
    }

    /// Lets `count` gated model calls answer.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.adapter.gate {
            gate.add_permits(count);
        }
    }

    /// Waits until the model has been asked `count` times.
    pub async fn wait_for_requests(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.requests().len() < count {
            assert!(
                Instant::now() < deadline,
                "model saw {} requests while waiting for {count}",
                self.requests().len()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn enqueue(&self, response: Response) {
        self.adapter
            .responses
            .lock()
            .expect("responses mutex")
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.adapter.requests.lock().expect("requests mutex").clone()
    }

    pub fn root(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    pub fn path(&self, relative: &str) -> String {
        self.dir.path().join(relative).to_string_lossy().into_owned()
    }

    pub fn seed(&self, relative: &str, content: &str) {
        std::fs::write(self.dir.path().join(relative), content).expect("seed file should write");
    }

    pub fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join(relative)).ok()
    }

    pub fn exists(&self, relative: &str) -> bool {
        Path::new(&self.path(relative)).exists()
    }

    pub async fn start(&self, options: AgentOptions) -> Result<SessionTask, OrchestratorError> {
        self.start_on(REMOTE, options).await
    }

    pub async fn start_on(
        &self,
        remote_ref: &str,
        options: AgentOptions,
    ) -> Result<SessionTask, OrchestratorError> {
        self.orchestrator
            .start_session(
                StartSession {
                    remote_ref: remote_ref.to_string(),
                    prompt: "do the task".to_string(),
                    context: ContextInfo::new(self.root()),
                    options,
                },
                Arc::new(self.emitter.clone()),
            )
            .await
    }

    pub async fn session(&self, session_id: &str) -> AgentSession {
        self.orchestrator
            .get_session(session_id)
            .await
            .expect("session should exist")
    }

    pub async fn wait_for_state(&self, session_id: &str, state: AgentState) -> AgentSession {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let session = self.session(session_id).await;
            if session.state == state {
                return session;
            }
            assert!(
                Instant::now() < deadline,
                "session stuck in {} while waiting for {state}",
                session.state
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn events_for(&self, session_id: &str) -> Vec<AgentEvent> {
        self.emitter
            .snapshot()
            .into_iter()
            .filter(|event| event.session_id.as_deref() == Some(session_id))
            .collect()
    }

    pub fn kinds_for(&self, session_id: &str) -> Vec<EventKind> {
        self.events_for(session_id)
            .iter()
            .map(|event| event.kind)
            .collect()
    }
}

pub fn auto_run() -> AgentOptions {
    AgentOptions {
        auto_run_commands: true,
        auto_install_deps: true,
        ..AgentOptions::default()
    }
}

pub fn last_tool_result(request: &Request) -> Option<(String, bool)> {
    request.messages.last().and_then(|message| {
        message.content.iter().find_map(|part| match part {
            ContentPart::ToolResult {
                content, is_error, ..
            } => Some((content.clone(), *is_error)),
            _ => None,
        })
    })
}
