// Agent invocation gateway.
//
// Validates a request, hands back a request id at once, and runs the
// generation in its own task. Whatever happens (answer, error, timeout,
// garbage) the task publishes exactly one message into the session through
// the hub: ANALYSIS on success, SYSTEM describing the failure otherwise.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use icroom_core::agent::{
    agent_display_name, agent_sender_id, is_valid_agent_type, AgentGenerator, AgentResult,
    GenerationError,
};
use icroom_core::config::AgentsConfig;
use icroom_core::error::{DebateError, DebateResult};
use icroom_core::model::{normalize_ticker, Message, MessageType, NewMessage, OriginKind, SessionStatus};
use icroom_core::notify::{Alert, Notifier};

use crate::hub::ChannelHub;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Upper bound on one generation attempt.
    pub timeout: Duration,
    /// Attempts per request, including the first. Only plain failures are
    /// retried.
    pub max_attempts: u32,
    /// Multiplied by the attempt number before each retry.
    pub retry_backoff: Duration,
}

impl GatewaySettings {
    pub fn from_config(agents: &AgentsConfig) -> Self {
        Self {
            timeout: agents.timeout(),
            max_attempts: agents.max_attempts.max(1),
            retry_backoff: agents.retry_backoff(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A validated request waiting for its single terminal message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub request_id: String,
    pub session_id: String,
    pub agent_type: String,
    pub ticker: String,
}

/// Handle to an accepted invocation. Dropping it does not cancel anything.
#[derive(Debug)]
pub struct Invocation {
    pub request: InvocationRequest,
    /// Resolves to the published message, or `None` if it could not be
    /// published (session completed meanwhile, storage failure).
    pub handle: JoinHandle<Option<Message>>,
}

// ---------------------------------------------------------------------------
// AgentGateway
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AgentGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    hub: Arc<ChannelHub>,
    generator: Arc<dyn AgentGenerator>,
    notifier: Arc<dyn Notifier>,
    settings: GatewaySettings,
    /// Request ids not yet settled.
    inflight: Mutex<HashSet<String>>,
}

impl AgentGateway {
    pub fn new(
        hub: Arc<ChannelHub>,
        generator: Arc<dyn AgentGenerator>,
        notifier: Arc<dyn Notifier>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                hub,
                generator,
                notifier,
                settings,
                inflight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Number of accepted requests that have not produced their message yet.
    pub fn inflight_count(&self) -> usize {
        self.inflight().len()
    }

    fn inflight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate and start an invocation. Must be called inside a tokio
    /// runtime; returns before any generation work is done.
    pub fn invoke(
        &self,
        session_id: &str,
        agent_type: &str,
        ticker: &str,
    ) -> DebateResult<Invocation> {
        let request = self.accept(session_id, agent_type, ticker)?;
        let handle = self.start(request.clone());
        Ok(Invocation { request, handle })
    }

    /// Validate a request and register it as pending. Every accepted request
    /// must be passed to [`AgentGateway::start`].
    pub fn accept(
        &self,
        session_id: &str,
        agent_type: &str,
        ticker: &str,
    ) -> DebateResult<InvocationRequest> {
        let agent_type = agent_type.trim().to_ascii_lowercase();
        if !is_valid_agent_type(&agent_type) {
            return Err(DebateError::InvalidRequest(format!(
                "invalid agent type {agent_type:?}"
            )));
        }
        let ticker = normalize_ticker(ticker)
            .ok_or_else(|| DebateError::InvalidRequest(format!("invalid ticker {ticker:?}")))?;

        let session = self.inner.hub.session(session_id)?;
        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Completed => {
                return Err(DebateError::SessionClosed(session_id.to_string()))
            }
            status => {
                return Err(DebateError::SessionNotActive {
                    id: session_id.to_string(),
                    status,
                })
            }
        }

        let request = InvocationRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            agent_type,
            ticker,
        };
        self.inflight().insert(request.request_id.clone());
        info!(
            session_id,
            request_id = %request.request_id,
            agent_type = %request.agent_type,
            ticker = %request.ticker,
            "agent invocation accepted"
        );
        Ok(request)
    }

    /// Spawn the generation task for an accepted request. The task is
    /// independent of the requesting connection.
    pub fn start(&self, request: InvocationRequest) -> JoinHandle<Option<Message>> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let result = gateway.generate(&request).await;
            gateway.settle(&request, result).await
        })
    }

    /// Run attempts until success, a non-retryable error, or the attempt
    /// budget is spent.
    async fn generate(&self, request: &InvocationRequest) -> Result<AgentResult, GenerationError> {
        let settings = self.inner.settings;
        let mut attempt: u32 = 1;
        loop {
            match self.attempt(request).await {
                Err(e) if e.is_retryable() && attempt < settings.max_attempts => {
                    warn!(
                        request_id = %request.request_id,
                        attempt,
                        "agent generation failed, retrying: {e}"
                    );
                    tokio::time::sleep(settings.retry_backoff * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// One bounded call to the generator. The call runs in its own task so a
    /// panic becomes a failure and a timeout can abort it.
    async fn attempt(&self, request: &InvocationRequest) -> Result<AgentResult, GenerationError> {
        let generator = Arc::clone(&self.inner.generator);
        let agent_type = request.agent_type.clone();
        let ticker = request.ticker.clone();
        let mut task = tokio::spawn(async move { generator.generate(&agent_type, &ticker).await });

        let limit = self.inner.settings.timeout;
        let result = match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(GenerationError::Failure(format!(
                "generation task ended abnormally: {join_error}"
            ))),
            Err(_) => {
                task.abort();
                Err(GenerationError::Timeout(limit))
            }
        };

        match result {
            Ok(output) if output.content.trim().is_empty() => {
                Err(GenerationError::Malformed("empty analysis".into()))
            }
            other => other,
        }
    }

    /// Publish the terminal message for `request`. Only the first call for a
    /// request id publishes; later calls return `None`.
    async fn settle(
        &self,
        request: &InvocationRequest,
        result: Result<AgentResult, GenerationError>,
    ) -> Option<Message> {
        if !self.inflight().remove(&request.request_id) {
            warn!(request_id = %request.request_id, "invocation already settled");
            return None;
        }

        let message = match result {
            Ok(output) => {
                debug!(request_id = %request.request_id, "agent generation succeeded");
                let mut message =
                    self.agent_message(request, output.content.trim(), MessageType::Analysis);
                message.stance = output.stance;
                message
            }
            Err(e) => {
                warn!(request_id = %request.request_id, "agent generation failed: {e}");
                self.inner.notifier.notify(Alert::InvocationFailed {
                    session_id: request.session_id.clone(),
                    request_id: request.request_id.clone(),
                    agent_type: request.agent_type.clone(),
                    ticker: request.ticker.clone(),
                    reason: e.to_string(),
                });
                let notice = e.user_message(&request.agent_type, &request.ticker);
                self.agent_message(request, &notice, MessageType::System)
            }
        };

        match self.inner.hub.publish(&request.session_id, message).await {
            Ok(published) => Some(published),
            Err(e) => {
                warn!(
                    session_id = %request.session_id,
                    request_id = %request.request_id,
                    "could not publish agent result: {e}"
                );
                self.inner.notifier.notify(Alert::InvocationFailed {
                    session_id: request.session_id.clone(),
                    request_id: request.request_id.clone(),
                    agent_type: request.agent_type.clone(),
                    ticker: request.ticker.clone(),
                    reason: format!("result not published: {e}"),
                });
                None
            }
        }
    }

    fn agent_message(
        &self,
        request: &InvocationRequest,
        content: &str,
        message_type: MessageType,
    ) -> NewMessage {
        NewMessage {
            sender_id: agent_sender_id(&request.agent_type),
            sender_name: agent_display_name(&request.agent_type),
            origin_kind: OriginKind::Agent,
            content: content.to_string(),
            message_type,
            stance: None,
            request_id: Some(request.request_id.clone()),
        }
    }
}
