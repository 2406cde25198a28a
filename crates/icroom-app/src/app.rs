// Connection event loop.
//
// Consumes `WsEvent`s from the WebSocket listener, keeps the registry of live
// connections, decodes client frames and dispatches them to the channel hub
// and the agent gateway. Errors are reported to the originating connection
// only; nothing a client sends can stop the loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use icroom_core::error::{DebateError, DebateResult};
use icroom_core::model::{MessageType, NewMessage};
use icroom_core::protocol::{ClientEvent, ServerEvent};
use icroom_core::ws_server::{ConnectionHandle, ConnectionId, WsEvent};

use crate::gateway::AgentGateway;
use crate::hub::ChannelHub;

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub hub: Arc<ChannelHub>,
    pub gateway: AgentGateway,
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl AppState {
    pub fn new(hub: Arc<ChannelHub>, gateway: AgentGateway) -> Self {
        Self {
            hub,
            gateway,
            connections: HashMap::new(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run until the listener's channel closes or `shutdown` resolves.
///
/// Client frames are handled one at a time in arrival order. Agent
/// generation runs in spawned tasks, so a slow agent never holds up other
/// clients.
pub async fn run<F>(
    mut ws_rx: mpsc::Receiver<WsEvent>,
    mut state: AppState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    info!("Debate event loop started");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            ws_event = ws_rx.recv() => {
                match ws_event {
                    Some(WsEvent::Connected { handle, addr }) => {
                        let connection_id = handle.id();
                        state.connections.insert(connection_id, handle);
                        info!(
                            connection_id,
                            connections = state.connection_count(),
                            "Client connected from {addr}"
                        );
                    }
                    Some(WsEvent::Message { connection_id, text }) => {
                        handle_client_frame(&mut state, connection_id, &text).await;
                    }
                    Some(WsEvent::Disconnected { connection_id }) => {
                        state.connections.remove(&connection_id);
                        let left = state.hub.leave_all(connection_id).await;
                        info!(
                            connection_id,
                            sessions_left = left,
                            connections = state.connection_count(),
                            "Client disconnected"
                        );
                    }
                    None => {
                        info!("WebSocket channel closed, shutting down");
                        break;
                    }
                }
            }

            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    for handle in state.connections.values() {
        handle.disconnect();
    }
    info!("Debate event loop exiting");
    Ok(())
}

/// Decode one text frame and act on it.
async fn handle_client_frame(state: &mut AppState, connection_id: ConnectionId, text: &str) {
    let Some(connection) = state.connections.get(&connection_id).cloned() else {
        warn!(connection_id, "frame from unregistered connection dropped");
        return;
    };

    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(connection_id, "unparseable client frame: {e}");
            let err = DebateError::InvalidRequest(format!("malformed event: {e}"));
            reply_error(&connection, &err, None);
            return;
        }
    };

    let session_id = event.session_id().map(str::to_string);
    if let Err(err) = dispatch(state, &connection, event).await {
        match &err {
            DebateError::Storage(cause) => {
                warn!(connection_id, ?session_id, "storage failure: {cause:#}")
            }
            other => debug!(connection_id, ?session_id, "request rejected: {other}"),
        }
        reply_error(&connection, &err, session_id);
    }
}

async fn dispatch(
    state: &mut AppState,
    connection: &ConnectionHandle,
    event: ClientEvent,
) -> DebateResult<()> {
    match event {
        ClientEvent::JoinDebate {
            session_id,
            user_name,
        } => {
            state
                .hub
                .join(&session_id, connection.clone(), &user_name)
                .await?;
        }
        ClientEvent::LeaveDebate { session_id, .. } => {
            state.hub.leave(&session_id, connection.id()).await?;
        }
        ClientEvent::SendDebateMessage {
            session_id,
            sender_id,
            sender_name,
            content,
            message_type,
        } => {
            if sender_id.trim().is_empty() {
                return Err(DebateError::InvalidRequest("senderId must not be empty".into()));
            }
            if message_type == MessageType::System {
                return Err(DebateError::InvalidRequest(
                    "participants cannot send SYSTEM messages".into(),
                ));
            }
            let message = NewMessage::human(sender_id, sender_name, content, message_type);
            state.hub.publish(&session_id, message).await?;
        }
        ClientEvent::InvokeAgentInDebate {
            session_id,
            agent_type,
            ticker,
        } => {
            let request = state.gateway.accept(&session_id, &agent_type, &ticker)?;
            reply(
                connection,
                ServerEvent::AgentInvocationAccepted {
                    session_id: request.session_id.clone(),
                    request_id: request.request_id.clone(),
                    agent_type: request.agent_type.clone(),
                    ticker: request.ticker.clone(),
                },
            );
            // Runs to completion even if this connection goes away.
            drop(state.gateway.start(request));
        }
        ClientEvent::CreateDebate { ticker, topic } => {
            let session = state.hub.create_session(&ticker, &topic)?;
            reply(connection, ServerEvent::DebateCreated { session });
        }
        ClientEvent::PauseDebate { session_id } => {
            state.hub.pause(&session_id).await?;
        }
        ClientEvent::ResumeDebate { session_id } => {
            state.hub.resume(&session_id).await?;
        }
        ClientEvent::SetDebatePhase { session_id, phase } => {
            state.hub.set_phase(&session_id, &phase).await?;
        }
        ClientEvent::CompleteDebate {
            session_id,
            outcome,
        } => {
            state.hub.complete(&session_id, outcome).await?;
        }
    }
    Ok(())
}

/// Queue a direct reply. A connection that cannot take it is closed.
fn reply(connection: &ConnectionHandle, event: ServerEvent) {
    if let Err(reason) = connection.try_deliver(event) {
        warn!(connection_id = connection.id(), "cannot queue reply ({reason}), closing");
        connection.disconnect();
    }
}

fn reply_error(connection: &ConnectionHandle, err: &DebateError, session_id: Option<String>) {
    reply(
        connection,
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.client_message(),
            session_id,
        },
    );
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
