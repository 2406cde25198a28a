// Agent-generation interface consumed by the invocation gateway.
//
// The generator itself (an LLM, a rules engine, a test double) lives outside
// this crate; the gateway only sees `AgentGenerator::generate`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Stance;

/// Structured output of one agent generation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub content: String,
    pub stance: Option<Stance>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    /// The external call errored (network, API status).
    #[error("agent generation failed: {0}")]
    Failure(String),

    /// No generator backend is configured; retrying cannot help.
    #[error("agent generation unavailable: {0}")]
    Unavailable(String),

    #[error("agent generation timed out after {0:?}")]
    Timeout(Duration),

    /// The call returned something that cannot be turned into a message.
    #[error("agent returned a malformed result: {0}")]
    Malformed(String),
}

impl GenerationError {
    /// Only plain failures are worth another attempt; a timeout already
    /// consumed the whole wait budget and a malformed answer is not transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Failure(_))
    }

    /// Failure notice shown to every member of the session. Never includes
    /// upstream error text.
    pub fn user_message(&self, agent_type: &str, ticker: &str) -> String {
        let agent = agent_display_name(agent_type);
        match self {
            GenerationError::Failure(_) => format!(
                "{agent} could not complete its analysis of {ticker}: the analysis service returned an error."
            ),
            GenerationError::Unavailable(_) => format!(
                "{agent} could not complete its analysis of {ticker}: the analysis service is not configured."
            ),
            GenerationError::Timeout(limit) => format!(
                "{agent} could not complete its analysis of {ticker}: no response within {}s.",
                limit.as_secs()
            ),
            GenerationError::Malformed(_) => format!(
                "{agent} could not complete its analysis of {ticker}: the response could not be understood."
            ),
        }
    }
}

#[async_trait]
pub trait AgentGenerator: Send + Sync {
    /// Run agent `agent_type` against `ticker`. Latency is unbounded; callers
    /// impose their own timeout.
    async fn generate(&self, agent_type: &str, ticker: &str)
        -> Result<AgentResult, GenerationError>;
}

// ---------------------------------------------------------------------------
// Agent identity
// ---------------------------------------------------------------------------

/// Agent types are lowercase slugs (`contrarian`, `risk_manager`).
pub fn is_valid_agent_type(agent_type: &str) -> bool {
    !agent_type.is_empty()
        && agent_type.len() <= 64
        && agent_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Deterministic sender id for messages produced on behalf of an agent.
pub fn agent_sender_id(agent_type: &str) -> String {
    format!("{agent_type}_agent")
}

/// `risk_manager` -> `Risk Manager Agent`.
pub fn agent_display_name(agent_type: &str) -> String {
    let mut words: Vec<String> = agent_type
        .split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    words.push("Agent".to_string());
    words.join(" ")
}
