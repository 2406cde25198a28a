// LLM-backed debate agent.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use icroom_core::agent::{AgentGenerator, AgentResult, GenerationError};
use icroom_core::model::Stance;

use crate::client::LlmClient;
use crate::prompt;

/// `AgentGenerator` that asks Claude to play the requested persona.
pub struct LlmAgent {
    client: LlmClient,
    max_tokens: u32,
}

impl LlmAgent {
    pub fn new(client: LlmClient, max_tokens: u32) -> Self {
        Self { client, max_tokens }
    }
}

#[async_trait]
impl AgentGenerator for LlmAgent {
    async fn generate(
        &self,
        agent_type: &str,
        ticker: &str,
    ) -> Result<AgentResult, GenerationError> {
        if !self.client.is_enabled() {
            return Err(GenerationError::Unavailable("LLM not configured".into()));
        }
        let system = prompt::system_prompt(agent_type);
        let user = prompt::build_debate_prompt(ticker);

        let completion = self
            .client
            .complete(&system, &user, self.max_tokens)
            .await
            .map_err(GenerationError::Failure)?;
        debug!(
            agent_type,
            ticker,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            "agent completion received"
        );

        parse_agent_output(&completion.text)
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawAgentOutput {
    #[serde(default)]
    stance: Option<String>,
    #[serde(default)]
    analysis: Option<String>,
}

/// Turn model output into an [`AgentResult`].
///
/// Accepts the requested JSON object (optionally wrapped in a code fence or
/// surrounded by prose) and falls back to plain text with an optional
/// `STANCE: ...` line. Empty output, or JSON without an analysis, is
/// `Malformed`.
pub fn parse_agent_output(text: &str) -> Result<AgentResult, GenerationError> {
    let body = strip_code_fence(text.trim());
    if body.is_empty() {
        return Err(GenerationError::Malformed("empty response".into()));
    }

    if let Some(json) = extract_json_object(body) {
        let raw: RawAgentOutput = serde_json::from_value(json)
            .map_err(|e| GenerationError::Malformed(format!("unexpected JSON shape: {e}")))?;
        let content = raw.analysis.as_deref().map(str::trim).unwrap_or_default();
        if content.is_empty() {
            return Err(GenerationError::Malformed("JSON response has no analysis".into()));
        }
        return Ok(AgentResult {
            content: content.to_string(),
            stance: raw.stance.as_deref().and_then(Stance::parse),
        });
    }

    let mut stance = None;
    let mut lines = Vec::new();
    for line in body.lines() {
        match line.trim().split_once(':') {
            Some((label, value)) if label.trim().eq_ignore_ascii_case("stance") => {
                stance = Stance::parse(value);
            }
            _ => lines.push(line),
        }
    }
    let content = lines.join("\n").trim().to_string();
    if content.is_empty() {
        return Err(GenerationError::Malformed("response has no analysis text".into()));
    }
    Ok(AgentResult { content, stance })
}

/// Remove a surrounding ```` ``` ```` / ```` ```json ```` fence.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// The outermost `{...}` span, if it parses as a JSON object.
fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;
    value.is_object().then_some(value)
}
