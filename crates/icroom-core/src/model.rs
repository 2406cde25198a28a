// Debate session and message records shared by every crate in the workspace.
//
// Enum values travel over the wire and into SQLite in SCREAMING_CASE
// (`ACTIVE`, `ANALYSIS`, `BULL`, ...). `as_str` and `parse` are the single
// place that mapping lives for the storage layer; serde handles the wire.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Lifecycle status of a debate session.
///
/// `ACTIVE <-> PAUSED`, either of them `-> COMPLETED`. `COMPLETED` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            SessionStatus::Active,
            SessionStatus::Paused,
            SessionStatus::Completed,
        ]
        .into_iter()
        .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Whether the status machine permits moving from `self` to `next`.
    /// Staying in the same status is not a transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Paused)
                | (SessionStatus::Paused, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Paused, SessionStatus::Completed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Committee decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Rejected,
    Deferred,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Approved => "APPROVED",
            Decision::Rejected => "REJECTED",
            Decision::Deferred => "DEFERRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [Decision::Approved, Decision::Rejected, Decision::Deferred]
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

// ---------------------------------------------------------------------------
// Message classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    Analysis,
    System,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Analysis => "ANALYSIS",
            MessageType::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [MessageType::Text, MessageType::Analysis, MessageType::System]
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// Position an agent takes in its analytical contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stance {
    Bull,
    Bear,
    Neutral,
}

impl Stance {
    pub fn as_str(self) -> &'static str {
        match self {
            Stance::Bull => "BULL",
            Stance::Bear => "BEAR",
            Stance::Neutral => "NEUTRAL",
        }
    }

    /// Case-insensitive; also accepts the adjective forms models tend to
    /// produce ("bullish", "bearish").
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BULL" | "BULLISH" => Some(Stance::Bull),
            "BEAR" | "BEARISH" => Some(Stance::Bear),
            "NEUTRAL" => Some(Stance::Neutral),
            _ => None,
        }
    }
}

/// Who authored a message. Set by the component that creates the message,
/// never inferred from `sender_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OriginKind {
    Human,
    Agent,
    System,
}

impl OriginKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OriginKind::Human => "HUMAN",
            OriginKind::Agent => "AGENT",
            OriginKind::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [OriginKind::Human, OriginKind::Agent, OriginKind::System]
            .into_iter()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A debate session as stored in `debate_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub ticker: String,
    pub topic: String,
    pub status: SessionStatus,
    /// Advisory label ("opening", "rebuttal", "closing", ...). Not enforced.
    pub current_phase: String,
    pub participant_count: u32,
    pub message_count: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub decision: Option<Decision>,
    pub summary: Option<String>,
    pub key_points: Option<Vec<String>>,
}

impl Session {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// Canonical ticker form: trimmed, upper-case, no inner whitespace.
pub fn normalize_ticker(raw: &str) -> Option<String> {
    let ticker = raw.trim().to_ascii_uppercase();
    if ticker.is_empty() || ticker.len() > 16 || ticker.contains(char::is_whitespace) {
        return None;
    }
    Some(ticker)
}

/// Everything recorded when a session is completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    pub decision: Decision,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// An accepted message, as stored in `debate_messages` and broadcast to
/// members. `seq` and `timestamp` are assigned by the channel hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub seq: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub origin_kind: OriginKind,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stance: Option<Stance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Epoch milliseconds, strictly increasing within a session.
    pub timestamp: i64,
}

/// A message that has not been accepted yet: no id, sequence number or
/// timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub origin_kind: OriginKind,
    pub content: String,
    pub message_type: MessageType,
    pub stance: Option<Stance>,
    pub request_id: Option<String>,
}

/// Sender identity used for hub-generated presence announcements.
pub const SYSTEM_SENDER_ID: &str = "system";
pub const SYSTEM_SENDER_NAME: &str = "Debate Room";

impl NewMessage {
    /// A message typed by a participant. Origin is always `HUMAN`, whatever
    /// the client claims in `sender_id`.
    pub fn human(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        NewMessage {
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            origin_kind: OriginKind::Human,
            content: content.into(),
            message_type,
            stance: None,
            request_id: None,
        }
    }

    /// A room notice (join/leave announcements).
    pub fn system(content: impl Into<String>) -> Self {
        NewMessage {
            sender_id: SYSTEM_SENDER_ID.to_string(),
            sender_name: SYSTEM_SENDER_NAME.to_string(),
            origin_kind: OriginKind::System,
            content: content.into(),
            message_type: MessageType::System,
            stance: None,
            request_id: None,
        }
    }
}
