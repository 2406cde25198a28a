// Claude API streaming client using reqwest-eventsource.
//
// Sends messages to the Anthropic Messages API with `stream: true` and parses
// the Server-Sent Events into `LlmEvent` variants forwarded over an mpsc
// channel. `LlmClient::complete` drains that channel into a single
// `Completion` for callers that only want the final text.

use futures_util::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use icroom_core::config::Config;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Incremental output of one streamed request.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    Token {
        text: String,
    },
    Complete {
        full_text: String,
        input_tokens: u32,
        output_tokens: u32,
    },
    Error {
        message: String,
    },
}

/// Final text of a finished request plus token usage.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ---------------------------------------------------------------------------
// ClaudeClient
// ---------------------------------------------------------------------------

/// Low-level Claude API streaming client.
pub struct ClaudeClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    api_url: String,
}

impl ClaudeClient {
    /// Create a new client with the given API key and model identifier.
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_api_url(api_key, model, ANTHROPIC_API_URL.to_string())
    }

    /// Same as [`ClaudeClient::new`] but posting to `api_url`.
    pub fn with_api_url(api_key: String, model: String, api_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            api_url,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a message to the Claude API and stream the response as `LlmEvent`s
    /// over `tx`.
    ///
    /// Returns when the stream is complete, an error occurs, or the receiver
    /// is dropped. Exactly one terminal event (`Complete` or `Error`) is sent
    /// unless the receiver went away first.
    pub async fn stream_message(
        &self,
        system: &str,
        user_content: &str,
        max_tokens: u32,
        tx: mpsc::Sender<LlmEvent>,
    ) -> anyhow::Result<()> {
        if self.api_key.is_empty() {
            let _ = tx
                .send(LlmEvent::Error {
                    message: "API key not configured".to_string(),
                })
                .await;
            return Ok(());
        }

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "stream": true,
            "system": system,
            "messages": [{ "role": "user", "content": user_content }]
        });

        let request = self
            .http
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body);

        let mut es = match request.eventsource() {
            Ok(es) => es,
            Err(e) => {
                let _ = tx
                    .send(LlmEvent::Error {
                        message: format!("Failed to create event source: {e}"),
                    })
                    .await;
                return Ok(());
            }
        };

        let mut full_text = String::new();
        let mut input_tokens: u32 = 0;
        let mut output_tokens: u32 = 0;

        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => {
                    debug!("SSE connection opened");
                }
                Ok(Event::Message(msg)) => {
                    let event_type = msg.event.as_str();
                    let data = &msg.data;

                    match event_type {
                        "message_start" => {
                            match parse_input_tokens(data) {
                                Some(n) => input_tokens = n,
                                None => warn!("failed to parse input_tokens from message_start"),
                            }
                            debug!(input_tokens, "message_start");
                        }
                        "content_block_delta" => {
                            if let Some(text) = parse_delta_text(data) {
                                full_text.push_str(&text);
                                if tx.send(LlmEvent::Token { text }).await.is_err() {
                                    es.close();
                                    return Ok(());
                                }
                            }
                        }
                        "message_delta" => {
                            match parse_output_tokens(data) {
                                Some(n) => output_tokens = n,
                                None => warn!("failed to parse output_tokens from message_delta"),
                            }
                            debug!(output_tokens, "message_delta");
                        }
                        "message_stop" => {
                            debug!("message_stop, streaming complete");
                            let _ = tx
                                .send(LlmEvent::Complete {
                                    full_text,
                                    input_tokens,
                                    output_tokens,
                                })
                                .await;
                            es.close();
                            return Ok(());
                        }
                        "error" => {
                            let message = parse_stream_error(data)
                                .unwrap_or_else(|| "API reported an error".to_string());
                            warn!("SSE error event: {message}");
                            let _ = tx.send(LlmEvent::Error { message }).await;
                            es.close();
                            return Ok(());
                        }
                        // ping, content_block_start, content_block_stop
                        _ => {
                            debug!(event_type, "ignoring SSE event");
                        }
                    }
                }
                Err(err) => {
                    warn!(?err, "SSE stream error");
                    let _ = tx
                        .send(LlmEvent::Error {
                            message: extract_error_message(&err),
                        })
                        .await;
                    es.close();
                    return Ok(());
                }
            }
        }

        // Stream ended without message_stop.
        if full_text.is_empty() {
            let _ = tx
                .send(LlmEvent::Error {
                    message: "Stream ended unexpectedly without any content".to_string(),
                })
                .await;
        } else {
            let _ = tx
                .send(LlmEvent::Complete {
                    full_text,
                    input_tokens,
                    output_tokens,
                })
                .await;
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LlmClient wrapper
// ---------------------------------------------------------------------------

/// High-level wrapper that can be either an active Claude client or disabled.
pub enum LlmClient {
    /// Claude API is configured and ready.
    Active(ClaudeClient),
    /// No API key configured; every request fails immediately.
    Disabled,
}

impl LlmClient {
    /// `Active` if an API key is present in credentials, otherwise `Disabled`.
    pub fn from_config(config: &Config) -> Self {
        match &config.credentials.anthropic_api_key {
            Some(key) if !key.is_empty() => {
                let model = config.agents.model.clone();
                LlmClient::Active(ClaudeClient::new(key.clone(), model))
            }
            _ => LlmClient::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, LlmClient::Active(_))
    }

    /// Stream a message, delegating to the inner `ClaudeClient` or immediately
    /// sending an error if disabled.
    pub async fn stream_message(
        &self,
        system: &str,
        user_content: &str,
        max_tokens: u32,
        tx: mpsc::Sender<LlmEvent>,
    ) -> anyhow::Result<()> {
        match self {
            LlmClient::Active(client) => {
                client
                    .stream_message(system, user_content, max_tokens, tx)
                    .await
            }
            LlmClient::Disabled => {
                let _ = tx
                    .send(LlmEvent::Error {
                        message: "LLM not configured".to_string(),
                    })
                    .await;
                Ok(())
            }
        }
    }

    /// Run one request to completion. The error string is upstream detail
    /// for logs, not for end users.
    pub async fn complete(
        &self,
        system: &str,
        user_content: &str,
        max_tokens: u32,
    ) -> Result<Completion, String> {
        let (tx, rx) = mpsc::channel(64);
        let (streamed, collected) = tokio::join!(
            self.stream_message(system, user_content, max_tokens, tx),
            collect_completion(rx),
        );
        streamed.map_err(|e| format!("{e:#}"))?;
        collected
    }
}

/// Drain `rx` until its terminal event.
pub async fn collect_completion(mut rx: mpsc::Receiver<LlmEvent>) -> Result<Completion, String> {
    while let Some(event) = rx.recv().await {
        match event {
            LlmEvent::Token { .. } => {}
            LlmEvent::Complete {
                full_text,
                input_tokens,
                output_tokens,
            } => {
                return Ok(Completion {
                    text: full_text,
                    input_tokens,
                    output_tokens,
                })
            }
            LlmEvent::Error { message } => return Err(message),
        }
    }
    Err("stream closed without a result".to_string())
}

// ---------------------------------------------------------------------------
// SSE JSON parsing helpers
// ---------------------------------------------------------------------------

/// Extract `input_tokens` from a `message_start` event's JSON.
///
/// Expected shape: `{ "type": "message_start", "message": { "usage": { "input_tokens": N } } }`
pub(crate) fn parse_input_tokens(data: &str) -> Option<u32> {
    let v: Value = serde_json::from_str(data).ok()?;
    v.get("message")?
        .get("usage")?
        .get("input_tokens")?
        .as_u64()
        .map(|n| n as u32)
}

/// Extract `delta.text` from a `content_block_delta` event's JSON.
///
/// Expected shape: `{ "type": "content_block_delta", "delta": { "type": "text_delta", "text": "..." } }`
pub(crate) fn parse_delta_text(data: &str) -> Option<String> {
    let v: Value = serde_json::from_str(data).ok()?;
    v.get("delta")?
        .get("text")?
        .as_str()
        .map(|s| s.to_string())
}

/// Extract `output_tokens` from a `message_delta` event's JSON.
///
/// Expected shape: `{ "type": "message_delta", "usage": { "output_tokens": N } }`
pub(crate) fn parse_output_tokens(data: &str) -> Option<u32> {
    let v: Value = serde_json::from_str(data).ok()?;
    v.get("usage")?
        .get("output_tokens")?
        .as_u64()
        .map(|n| n as u32)
}

/// Extract `error.message` from an in-stream `error` event.
///
/// Expected shape: `{ "type": "error", "error": { "type": "overloaded_error", "message": "..." } }`
pub(crate) fn parse_stream_error(data: &str) -> Option<String> {
    let v: Value = serde_json::from_str(data).ok()?;
    v.get("error")?
        .get("message")?
        .as_str()
        .map(|s| s.to_string())
}

/// Extract a human-readable error message from an SSE error.
fn extract_error_message(err: &reqwest_eventsource::Error) -> String {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _response) => {
            format!("API returned status {status}")
        }
        reqwest_eventsource::Error::Transport(e) => {
            format!("Network error: {e}")
        }
        other => format!("Stream error: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
