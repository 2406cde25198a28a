// JSON wire protocol between debate clients and the server.
//
// Every frame is a JSON object with a snake_case `type` tag and camelCase
// fields, e.g. `{"type":"join_debate","sessionId":"...","userName":"Ana"}`.

use serde::{Deserialize, Serialize};

use crate::model::{Message, MessageType, OriginKind, Session, SessionOutcome};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinDebate { session_id: String, user_name: String },

    #[serde(rename_all = "camelCase")]
    LeaveDebate {
        session_id: String,
        #[serde(default)]
        user_name: String,
    },

    #[serde(rename_all = "camelCase")]
    SendDebateMessage {
        session_id: String,
        sender_id: String,
        sender_name: String,
        content: String,
        #[serde(default)]
        message_type: MessageType,
    },

    #[serde(rename_all = "camelCase")]
    InvokeAgentInDebate {
        session_id: String,
        agent_type: String,
        ticker: String,
    },

    #[serde(rename_all = "camelCase")]
    CreateDebate { ticker: String, topic: String },

    #[serde(rename_all = "camelCase")]
    PauseDebate { session_id: String },

    #[serde(rename_all = "camelCase")]
    ResumeDebate { session_id: String },

    #[serde(rename_all = "camelCase")]
    SetDebatePhase { session_id: String, phase: String },

    #[serde(rename_all = "camelCase")]
    CompleteDebate {
        session_id: String,
        #[serde(flatten)]
        outcome: SessionOutcome,
    },
}

impl ClientEvent {
    /// Session the event targets, if any (used to tag error replies).
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientEvent::JoinDebate { session_id, .. }
            | ClientEvent::LeaveDebate { session_id, .. }
            | ClientEvent::SendDebateMessage { session_id, .. }
            | ClientEvent::InvokeAgentInDebate { session_id, .. }
            | ClientEvent::PauseDebate { session_id }
            | ClientEvent::ResumeDebate { session_id }
            | ClientEvent::SetDebatePhase { session_id, .. }
            | ClientEvent::CompleteDebate { session_id, .. } => Some(session_id),
            ClientEvent::CreateDebate { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full ordered history, sent only to the connection that just joined.
    #[serde(rename_all = "camelCase")]
    DebateState {
        session_id: String,
        session: Session,
        messages: Vec<Message>,
    },

    #[serde(rename_all = "camelCase")]
    NewDebateMessage { session_id: String, message: Message },

    #[serde(rename_all = "camelCase")]
    AgentDebateResponse {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: Message,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        session_id: String,
        user_name: String,
        participant_count: u32,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        session_id: String,
        user_name: String,
        participant_count: u32,
    },

    #[serde(rename_all = "camelCase")]
    DebateStatus { session: Session },

    #[serde(rename_all = "camelCase")]
    DebateCreated { session: Session },

    #[serde(rename_all = "camelCase")]
    AgentInvocationAccepted {
        session_id: String,
        request_id: String,
        agent_type: String,
        ticker: String,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ServerEvent {
    /// Broadcast form of an accepted message: agent output goes out as
    /// `agent_debate_response`, everything else as `new_debate_message`.
    pub fn for_message(message: Message) -> Self {
        let session_id = message.session_id.clone();
        match message.origin_kind {
            OriginKind::Agent => ServerEvent::AgentDebateResponse {
                session_id,
                request_id: message.request_id.clone(),
                message,
            },
            OriginKind::Human | OriginKind::System => {
                ServerEvent::NewDebateMessage { session_id, message }
            }
        }
    }

    /// The message carried by a message event, if this is one.
    pub fn message(&self) -> Option<&Message> {
        match self {
            ServerEvent::NewDebateMessage { message, .. }
            | ServerEvent::AgentDebateResponse { message, .. } => Some(message),
            _ => None,
        }
    }
}
