// End-to-end tests for the debate room.
//
// These drive the hub, the gateway and the event loop together through the
// library's public API, backed by an in-memory SQLite store. They check the
// properties members rely on: one total order per session, history replay
// equal to the accepted log, closed sessions rejecting writes, exactly one
// terminal message per agent invocation, and session counters that match
// live state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use icroom_app::app::{self, AppState};
use icroom_app::gateway::{AgentGateway, GatewaySettings};
use icroom_app::hub::ChannelHub;
use icroom_core::agent::{AgentGenerator, AgentResult, GenerationError};
use icroom_core::db::Database;
use icroom_core::error::DebateError;
use icroom_core::model::{
    Decision, Message, MessageType, NewMessage, OriginKind, SessionOutcome, Stance,
};
use icroom_core::notify::LogNotifier;
use icroom_core::protocol::ServerEvent;
use icroom_core::ws_server::{ConnectionHandle, ConnectionId, WsEvent};

// ===========================================================================
// Test helpers
// ===========================================================================

/// Answers every request with a short bearish take.
struct CannedGenerator;

#[async_trait]
impl AgentGenerator for CannedGenerator {
    async fn generate(
        &self,
        agent_type: &str,
        ticker: &str,
    ) -> Result<AgentResult, GenerationError> {
        Ok(AgentResult {
            content: format!("{agent_type}: {ticker} is priced for perfection."),
            stance: Some(Stance::Bear),
        })
    }
}

/// Never answers.
struct SilentGenerator;

#[async_trait]
impl AgentGenerator for SilentGenerator {
    async fn generate(&self, _: &str, _: &str) -> Result<AgentResult, GenerationError> {
        std::future::pending().await
    }
}

/// Answers once `gate` is notified.
struct GatedGenerator {
    gate: Arc<Notify>,
}

#[async_trait]
impl AgentGenerator for GatedGenerator {
    async fn generate(
        &self,
        agent_type: &str,
        ticker: &str,
    ) -> Result<AgentResult, GenerationError> {
        self.gate.notified().await;
        Ok(AgentResult {
            content: format!("{agent_type}: {ticker} still looks stretched."),
            stance: None,
        })
    }
}

fn hub() -> Arc<ChannelHub> {
    Arc::new(ChannelHub::new(
        Arc::new(Database::open(":memory:").expect("in-memory database should open")),
        Arc::new(LogNotifier),
    ))
}

fn gateway(hub: &Arc<ChannelHub>, generator: Arc<dyn AgentGenerator>) -> AgentGateway {
    AgentGateway::new(
        hub.clone(),
        generator,
        Arc::new(LogNotifier),
        GatewaySettings {
            timeout: Duration::from_secs(5),
            max_attempts: 1,
            retry_backoff: Duration::from_millis(10),
        },
    )
}

fn connection(id: ConnectionId, capacity: usize) -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ConnectionHandle::new(id, tx), rx)
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Messages carried by message events, in delivery order.
fn messages(events: &[ServerEvent]) -> Vec<Message> {
    events.iter().filter_map(|e| e.message().cloned()).collect()
}

fn human(sender: &str, content: &str) -> NewMessage {
    NewMessage::human(format!("user-{sender}"), sender, content, MessageType::Text)
}

/// Register a fake socket with the event loop and return its outbound queue.
async fn connect(ws_tx: &mpsc::Sender<WsEvent>, id: ConnectionId) -> mpsc::Receiver<ServerEvent> {
    let (handle, rx) = connection(id, 64);
    ws_tx
        .send(WsEvent::Connected {
            handle,
            addr: format!("10.0.0.{id}:5000"),
        })
        .await
        .unwrap();
    rx
}

async fn send(ws_tx: &mpsc::Sender<WsEvent>, id: ConnectionId, json: serde_json::Value) {
    ws_tx
        .send(WsEvent::Message {
            connection_id: id,
            text: json.to_string(),
        })
        .await
        .unwrap();
}

// ===========================================================================
// Full debate over the event loop
// ===========================================================================

#[tokio::test]
async fn two_members_debate_with_an_agent() {
    let hub = hub();
    let session = hub.create_session("NVDA", "AI capex cycle").unwrap();
    let state = AppState::new(hub.clone(), gateway(&hub, Arc::new(CannedGenerator)));
    let (ws_tx, ws_rx) = mpsc::channel(64);
    let event_loop = tokio::spawn(app::run(ws_rx, state, std::future::pending()));

    let mut a = connect(&ws_tx, 1).await;
    let mut b = connect(&ws_tx, 2).await;

    // A joins first: empty history, nobody else to tell.
    send(&ws_tx, 1, serde_json::json!({"type": "join_debate", "sessionId": session.id, "userName": "Ana"})).await;
    match a.recv().await.unwrap() {
        ServerEvent::DebateState { messages, session: s, .. } => {
            assert!(messages.is_empty());
            assert_eq!(s.participant_count, 1);
        }
        other => panic!("expected debate_state, got {other:?}"),
    }

    // B joins: empty history for B, participant_joined for A.
    send(&ws_tx, 2, serde_json::json!({"type": "join_debate", "sessionId": session.id, "userName": "Ben"})).await;
    match b.recv().await.unwrap() {
        ServerEvent::DebateState { messages, .. } => assert!(messages.is_empty()),
        other => panic!("expected debate_state, got {other:?}"),
    }
    assert_eq!(
        a.recv().await.unwrap(),
        ServerEvent::ParticipantJoined {
            session_id: session.id.clone(),
            user_name: "Ben".into(),
            participant_count: 2,
        }
    );

    // A says hello: both see the identical message.
    send(
        &ws_tx,
        1,
        serde_json::json!({
            "type": "send_debate_message", "sessionId": session.id,
            "senderId": "user-ana", "senderName": "Ana", "content": "Hello", "messageType": "TEXT"
        }),
    )
    .await;
    let hello_a = a.recv().await.unwrap();
    let hello_b = b.recv().await.unwrap();
    assert!(matches!(hello_a, ServerEvent::NewDebateMessage { .. }));
    assert_eq!(hello_a, hello_b);
    assert_eq!(hello_a.message().unwrap().content, "Hello");
    assert_eq!(hub.session(&session.id).unwrap().message_count, 1);

    // B invokes the contrarian: B is told it was accepted, then both get
    // exactly one analysis.
    send(
        &ws_tx,
        2,
        serde_json::json!({
            "type": "invoke_agent_in_debate", "sessionId": session.id,
            "agentType": "contrarian", "ticker": "NVDA"
        }),
    )
    .await;
    let request_id = match b.recv().await.unwrap() {
        ServerEvent::AgentInvocationAccepted { request_id, .. } => request_id,
        other => panic!("expected agent_invocation_accepted, got {other:?}"),
    };
    let reply_a = a.recv().await.unwrap();
    let reply_b = b.recv().await.unwrap();
    assert_eq!(reply_a, reply_b);
    match reply_a {
        ServerEvent::AgentDebateResponse {
            request_id: echoed,
            message,
            ..
        } => {
            assert_eq!(echoed, Some(request_id));
            assert_eq!(message.message_type, MessageType::Analysis);
            assert_eq!(message.origin_kind, OriginKind::Agent);
            assert_eq!(message.sender_id, "contrarian_agent");
            assert_eq!(message.stance, Some(Stance::Bear));
            assert_eq!(message.seq, 2);
        }
        other => panic!("expected agent_debate_response, got {other:?}"),
    }
    assert_eq!(hub.session(&session.id).unwrap().message_count, 2);

    // A leaves: B is told.
    send(&ws_tx, 1, serde_json::json!({"type": "leave_debate", "sessionId": session.id, "userName": "Ana"})).await;
    assert_eq!(
        b.recv().await.unwrap(),
        ServerEvent::ParticipantLeft {
            session_id: session.id.clone(),
            user_name: "Ana".into(),
            participant_count: 1,
        }
    );
    assert!(a.try_recv().is_err());

    drop(ws_tx);
    event_loop.await.unwrap().unwrap();
}

// ===========================================================================
// Ordering and history
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_are_seen_in_one_order() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 25;

    let hub = hub();
    let session = hub.create_session("AAPL", "").unwrap();
    let mut receivers = Vec::new();
    for id in 1..=3 {
        let (handle, rx) = connection(id, 512);
        hub.join(&session.id, handle, &format!("member-{id}")).await.unwrap();
        receivers.push(rx);
    }

    let mut writers = Vec::new();
    for w in 0..WRITERS {
        let hub = hub.clone();
        let session_id = session.id.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..PER_WRITER {
                hub.publish(&session_id, human(&format!("w{w}"), &format!("{w}-{i}")))
                    .await
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let seen: Vec<Vec<Message>> = receivers.iter_mut().map(|rx| messages(&drain(rx))).collect();
    assert_eq!(seen[0].len(), WRITERS * PER_WRITER);
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[1], seen[2]);

    // Sequence numbers are gapless and timestamps strictly increase.
    for (i, pair) in seen[0].windows(2).enumerate() {
        assert_eq!(pair[0].seq, i as i64 + 1);
        assert_eq!(pair[1].seq, pair[0].seq + 1);
        assert!(pair[1].timestamp > pair[0].timestamp);
    }

    // Each writer's own messages keep their submission order.
    for w in 0..WRITERS {
        let own: Vec<String> = seen[0]
            .iter()
            .filter(|m| m.sender_name == format!("w{w}"))
            .map(|m| m.content.clone())
            .collect();
        let expected: Vec<String> = (0..PER_WRITER).map(|i| format!("{w}-{i}")).collect();
        assert_eq!(own, expected);
    }

    assert_eq!(hub.history(&session.id).unwrap(), seen[0]);
}

#[tokio::test]
async fn late_joiner_history_equals_accepted_log() {
    let hub = hub();
    let gateway = gateway(&hub, Arc::new(CannedGenerator));
    let session = hub.create_session("MSFT", "Cloud margins").unwrap();
    let (early, mut early_rx) = connection(1, 64);
    hub.join(&session.id, early, "Ana").await.unwrap();

    let mut accepted = Vec::new();
    accepted.push(hub.publish(&session.id, human("Ana", "Opening thesis")).await.unwrap());
    let invocation = gateway.invoke(&session.id, "quant", "msft").unwrap();
    accepted.push(invocation.handle.await.unwrap().unwrap());
    accepted.push(hub.publish(&session.id, human("Ana", "Noted")).await.unwrap());

    // A rejected write leaves no trace.
    assert!(hub.publish(&session.id, human("Ana", "   ")).await.is_err());

    let (late, mut late_rx) = connection(2, 64);
    hub.join(&session.id, late, "Ben").await.unwrap();
    match late_rx.recv().await.unwrap() {
        ServerEvent::DebateState { messages, session: s, .. } => {
            assert_eq!(messages, accepted);
            assert_eq!(s.message_count, 3);
        }
        other => panic!("expected debate_state, got {other:?}"),
    }

    // The early member saw the same messages live.
    let early_events = drain(&mut early_rx);
    assert_eq!(messages(&early_events[1..]), accepted);
}

#[tokio::test]
async fn rejoin_after_disconnect_replays_everything_missed() {
    let hub = hub();
    let session = hub.create_session("TSLA", "").unwrap();
    let (a, _a_rx) = connection(1, 64);
    let (b, mut b_rx) = connection(2, 64);
    hub.join(&session.id, a, "Ana").await.unwrap();
    hub.join(&session.id, b, "Ben").await.unwrap();
    hub.publish(&session.id, human("Ana", "one")).await.unwrap();

    assert_eq!(hub.leave_all(2).await, 1);
    hub.publish(&session.id, human("Ana", "two")).await.unwrap();

    let (b_again, mut b_again_rx) = connection(3, 64);
    hub.join(&session.id, b_again, "Ben").await.unwrap();
    match b_again_rx.recv().await.unwrap() {
        ServerEvent::DebateState { messages, .. } => {
            let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, vec!["one", "two"]);
        }
        other => panic!("expected debate_state, got {other:?}"),
    }
    // The old queue saw nothing after leaving.
    assert!(messages(&drain(&mut b_rx))
        .iter()
        .all(|m| m.content != "two"));
}

// ===========================================================================
// Completed sessions
// ===========================================================================

#[tokio::test]
async fn completed_session_rejects_messages_and_invocations() {
    let hub = hub();
    let gateway = gateway(&hub, Arc::new(CannedGenerator));
    let session = hub.create_session("NVDA", "").unwrap();
    let (a, mut a_rx) = connection(1, 64);
    hub.join(&session.id, a, "Ana").await.unwrap();
    hub.publish(&session.id, human("Ana", "Final word")).await.unwrap();

    let done = hub
        .complete(
            &session.id,
            SessionOutcome {
                decision: Decision::Rejected,
                summary: Some("Valuation too rich".into()),
                key_points: vec!["Multiple".into(), "Supply".into()],
            },
        )
        .await
        .unwrap();
    assert!(done.is_completed());
    assert!(done.ended_at.is_some());

    let err = hub
        .publish(&session.id, human("Ana", "One more thing"))
        .await
        .unwrap_err();
    assert!(matches!(err, DebateError::SessionClosed(_)));
    assert!(matches!(
        gateway.invoke(&session.id, "bull", "NVDA"),
        Err(DebateError::SessionClosed(_))
    ));
    assert!(matches!(
        hub.pause(&session.id).await,
        Err(DebateError::SessionClosed(_))
    ));

    assert_eq!(hub.history(&session.id).unwrap().len(), 1);
    assert_eq!(hub.session(&session.id).unwrap().message_count, 1);

    // The member saw the status change, then nothing else.
    let events = drain(&mut a_rx);
    assert!(matches!(
        events.last(),
        Some(ServerEvent::DebateStatus { session }) if session.decision == Some(Decision::Rejected)
    ));
}

// ===========================================================================
// Agent invocations
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn timed_out_invocation_yields_exactly_one_system_message() {
    let hub = hub();
    let gateway = gateway(&hub, Arc::new(SilentGenerator));
    let session = hub.create_session("NVDA", "").unwrap();
    let (a, mut a_rx) = connection(1, 64);
    let (b, mut b_rx) = connection(2, 64);
    hub.join(&session.id, a, "Ana").await.unwrap();
    hub.join(&session.id, b, "Ben").await.unwrap();
    drain(&mut a_rx);
    drain(&mut b_rx);
    let before = hub.session(&session.id).unwrap().message_count;

    let invocation = gateway.invoke(&session.id, "contrarian", "NVDA").unwrap();
    assert_eq!(gateway.inflight_count(), 1);
    let message = invocation
        .handle
        .await
        .unwrap()
        .expect("failure notice should be published");

    assert_eq!(message.message_type, MessageType::System);
    assert_eq!(message.origin_kind, OriginKind::Agent);
    assert_eq!(message.request_id.as_deref(), Some(invocation.request.request_id.as_str()));
    assert!(message.content.contains("Contrarian Agent"));
    assert!(message.content.contains("NVDA"));
    assert_eq!(gateway.inflight_count(), 0);
    assert_eq!(hub.session(&session.id).unwrap().message_count, before + 1);

    // Give any stray task a chance to publish a second result.
    tokio::time::sleep(Duration::from_secs(60)).await;
    for rx in [&mut a_rx, &mut b_rx] {
        let seen = messages(&drain(rx));
        assert_eq!(seen, vec![message.clone()]);
    }
    assert_eq!(hub.session(&session.id).unwrap().message_count, before + 1);
}

#[tokio::test]
async fn requester_disconnect_does_not_cancel_invocation() {
    let hub = hub();
    let gate = Arc::new(Notify::new());
    let gateway = gateway(&hub, Arc::new(GatedGenerator { gate: gate.clone() }));
    let session = hub.create_session("NVDA", "").unwrap();
    let state = AppState::new(hub.clone(), gateway.clone());
    let (ws_tx, ws_rx) = mpsc::channel(64);
    let event_loop = tokio::spawn(app::run(ws_rx, state, std::future::pending()));

    let mut a = connect(&ws_tx, 1).await;
    let mut b = connect(&ws_tx, 2).await;
    for (id, name) in [(1, "Ana"), (2, "Ben")] {
        send(&ws_tx, id, serde_json::json!({"type": "join_debate", "sessionId": session.id, "userName": name})).await;
    }
    assert!(matches!(a.recv().await.unwrap(), ServerEvent::DebateState { .. }));
    assert!(matches!(a.recv().await.unwrap(), ServerEvent::ParticipantJoined { .. }));
    assert!(matches!(b.recv().await.unwrap(), ServerEvent::DebateState { .. }));

    send(
        &ws_tx,
        2,
        serde_json::json!({
            "type": "invoke_agent_in_debate", "sessionId": session.id,
            "agentType": "contrarian", "ticker": "NVDA"
        }),
    )
    .await;
    let request_id = match b.recv().await.unwrap() {
        ServerEvent::AgentInvocationAccepted { request_id, .. } => request_id,
        other => panic!("expected agent_invocation_accepted, got {other:?}"),
    };

    // B goes away while the agent is still thinking.
    ws_tx
        .send(WsEvent::Disconnected { connection_id: 2 })
        .await
        .unwrap();
    assert!(matches!(
        a.recv().await.unwrap(),
        ServerEvent::ParticipantLeft { participant_count: 1, .. }
    ));
    assert_eq!(gateway.inflight_count(), 1);
    let before = hub.session(&session.id).unwrap().message_count;

    gate.notify_one();
    match a.recv().await.unwrap() {
        ServerEvent::AgentDebateResponse {
            request_id: echoed,
            message,
            ..
        } => {
            assert_eq!(echoed, Some(request_id));
            assert_eq!(message.message_type, MessageType::Analysis);
        }
        other => panic!("expected agent_debate_response, got {other:?}"),
    }
    assert!(a.try_recv().is_err());
    assert_eq!(gateway.inflight_count(), 0);
    assert_eq!(hub.session(&session.id).unwrap().message_count, before + 1);

    drop(ws_tx);
    event_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn concurrent_invocations_each_settle_once() {
    let hub = hub();
    let gateway = gateway(&hub, Arc::new(CannedGenerator));
    let session = hub.create_session("AMD", "").unwrap();
    let (a, mut a_rx) = connection(1, 64);
    hub.join(&session.id, a, "Ana").await.unwrap();

    let invocations: Vec<_> = ["bull", "bear", "bull", "macro"]
        .into_iter()
        .map(|agent| gateway.invoke(&session.id, agent, "AMD").unwrap())
        .collect();
    let mut request_ids = Vec::new();
    for invocation in invocations {
        let message = invocation.handle.await.unwrap().unwrap();
        assert_eq!(message.request_id.as_deref(), Some(invocation.request.request_id.as_str()));
        request_ids.push(invocation.request.request_id);
    }

    let mut published: Vec<String> = messages(&drain(&mut a_rx)[1..])
        .into_iter()
        .filter_map(|m| m.request_id)
        .collect();
    published.sort();
    request_ids.sort();
    assert_eq!(published, request_ids);
    assert_eq!(gateway.inflight_count(), 0);
    assert_eq!(hub.session(&session.id).unwrap().message_count, 4);
}

#[tokio::test]
async fn paused_session_accepts_messages_but_not_invocations() {
    let hub = hub();
    let gateway = gateway(&hub, Arc::new(CannedGenerator));
    let session = hub.create_session("NVDA", "").unwrap();
    hub.pause(&session.id).await.unwrap();

    assert!(matches!(
        gateway.invoke(&session.id, "bear", "NVDA"),
        Err(DebateError::SessionNotActive { .. })
    ));
    hub.publish(&session.id, human("Ana", "While paused")).await.unwrap();

    hub.resume(&session.id).await.unwrap();
    let message = gateway
        .invoke(&session.id, "bear", "NVDA")
        .unwrap()
        .handle
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.seq, 2);
}

// ===========================================================================
// Session counters
// ===========================================================================

#[tokio::test]
async fn counters_track_presence_and_log_length() {
    let hub = hub();
    let session = hub.create_session("GOOG", "").unwrap();
    let id = session.id.as_str();

    let check = || {
        let stored = hub.session(id).unwrap();
        assert_eq!(stored.participant_count as usize, hub.presence().count(id));
        assert_eq!(stored.message_count as usize, hub.history(id).unwrap().len());
    };
    check();

    let mut rxs = Vec::new();
    for conn in 1..=3 {
        let (handle, rx) = connection(conn, 64);
        hub.join(id, handle, &format!("member-{conn}")).await.unwrap();
        rxs.push(rx);
        check();
    }
    for i in 0..5 {
        hub.publish(id, human("member-1", &format!("point {i}"))).await.unwrap();
    }
    check();

    hub.leave(id, 2).await.unwrap();
    check();
    hub.leave_all(3).await;
    check();

    // A member whose socket is gone is evicted on the next fan-out.
    drop(rxs.remove(0));
    hub.publish(id, human("member-x", "anyone there?")).await.unwrap();
    check();
    assert_eq!(hub.presence().count(id), 0);
    assert_eq!(hub.session(id).unwrap().participant_count, 0);
}
