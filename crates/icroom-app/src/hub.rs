// Channel hub: one ordered broadcast channel per debate session.
//
// Every state-changing operation on a session (message append, membership
// change, status change) runs under that session's async lock together with
// the fan-out of the events it produces, so all members observe one order.
// Different sessions never share a lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use icroom_core::error::{DebateError, DebateResult};
use icroom_core::model::{
    normalize_ticker, Message, NewMessage, Session, SessionOutcome, SessionStatus,
};
use icroom_core::notify::{Alert, Notifier};
use icroom_core::protocol::ServerEvent;
use icroom_core::store::SessionStore;
use icroom_core::ws_server::{ConnectionHandle, ConnectionId, DeliveryError};

use crate::presence::{Participant, PresenceTracker};

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

/// Position of the newest accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    seq: i64,
    timestamp: i64,
}

impl Cursor {
    /// Position for the next message. Timestamps follow the wall clock but
    /// never repeat or go backwards within a session.
    fn next(self, now_ms: i64) -> Cursor {
        Cursor {
            seq: self.seq + 1,
            timestamp: now_ms.max(self.timestamp + 1),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    /// Loaded from the store on first append.
    cursor: Option<Cursor>,
    /// Set on teardown; a task that was waiting on this lock must fetch the
    /// replacement channel instead.
    retired: bool,
}

type Channel = Arc<AsyncMutex<ChannelState>>;

/// Exclusive access to one session's channel.
struct ChannelGuard {
    channel: Channel,
    state: OwnedMutexGuard<ChannelState>,
}

/// Result of [`ChannelHub::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// New member; the others were sent `participant_joined`.
    Joined,
    /// Already a member; only the history was replayed.
    Rejoined,
    /// The history could not be queued, so the connection was dropped.
    Dropped,
}

// ---------------------------------------------------------------------------
// ChannelHub
// ---------------------------------------------------------------------------

pub struct ChannelHub {
    store: Arc<dyn SessionStore>,
    notifier: Arc<dyn Notifier>,
    presence: PresenceTracker,
    channels: Mutex<HashMap<String, Channel>>,
    announce_presence: bool,
}

impl ChannelHub {
    pub fn new(store: Arc<dyn SessionStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            presence: PresenceTracker::new(),
            channels: Mutex::new(HashMap::new()),
            announce_presence: false,
        }
    }

    /// Also record joins and leaves as SYSTEM messages in the log.
    pub fn with_presence_announcements(mut self, enabled: bool) -> Self {
        self.announce_presence = enabled;
        self
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Number of live channels (sessions with in-memory ordering state).
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    // -- Sessions ----------------------------------------------------------

    pub fn create_session(&self, ticker: &str, topic: &str) -> DebateResult<Session> {
        let ticker = normalize_ticker(ticker)
            .ok_or_else(|| DebateError::InvalidRequest(format!("invalid ticker {ticker:?}")))?;
        let topic = match topic.trim() {
            "" => format!("{ticker} investment committee debate"),
            t => t.to_string(),
        };
        let session = self.store.create_session(&ticker, &topic)?;
        info!(session_id = %session.id, %ticker, "debate session created");
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> DebateResult<Session> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| DebateError::SessionNotFound(session_id.to_string()))
    }

    /// Accepted messages in order.
    pub fn history(&self, session_id: &str) -> DebateResult<Vec<Message>> {
        self.session(session_id)?;
        Ok(self.store.load_messages(session_id)?)
    }

    // -- Membership --------------------------------------------------------

    /// Make `connection` a member of the session.
    ///
    /// The joiner is sent `debate_state` (the session and its full history)
    /// before any event that follows the join; the other members are sent
    /// `participant_joined`. Joining again on the same connection replays the
    /// history without changing membership.
    pub async fn join(
        &self,
        session_id: &str,
        connection: ConnectionHandle,
        user_name: &str,
    ) -> DebateResult<JoinOutcome> {
        let user_name = user_name.trim();
        if user_name.is_empty() {
            return Err(DebateError::InvalidRequest("userName must not be empty".into()));
        }

        let (mut guard, mut session) = self.open_channel(session_id).await?;
        let messages = self.store.load_messages(session_id)?;
        let connection_id = connection.id();
        let added = self.presence.add(Participant::new(
            connection.clone(),
            session_id,
            user_name,
        ));
        session.participant_count = self.sync_count(session_id);

        let snapshot = ServerEvent::DebateState {
            session_id: session_id.to_string(),
            session: session.clone(),
            messages,
        };
        if let Err(reason) = connection.try_deliver(snapshot) {
            warn!(session_id, connection_id, "cannot queue debate history ({reason}), dropping connection");
            self.presence.remove(session_id, connection_id);
            connection.disconnect();
            if !added {
                let events = self.departure(&mut guard.state, session_id, user_name, false);
                self.fanout(&mut guard.state, session_id, events, None, false);
            } else {
                self.sync_count(session_id);
            }
            self.retire_if_idle(session_id, &session, guard);
            return Ok(JoinOutcome::Dropped);
        }

        if !added {
            debug!(session_id, connection_id, "re-join, history replayed");
            return Ok(JoinOutcome::Rejoined);
        }

        info!(
            session_id,
            connection_id,
            user_name,
            participants = session.participant_count,
            "member joined"
        );
        let announce = self.announces(&session);
        let mut events = vec![ServerEvent::ParticipantJoined {
            session_id: session_id.to_string(),
            user_name: user_name.to_string(),
            participant_count: session.participant_count,
        }];
        self.fanout(&mut guard.state, session_id, events, Some(connection_id), announce);

        if announce {
            events = self
                .announcement(&mut guard.state, session_id, format!("{user_name} joined the debate"))
                .map(ServerEvent::for_message)
                .into_iter()
                .collect();
            self.fanout(&mut guard.state, session_id, events, None, announce);
        }
        Ok(JoinOutcome::Joined)
    }

    /// Remove the connection from the session and tell the remaining members.
    /// Returns `false` if it was not a member.
    pub async fn leave(&self, session_id: &str, connection_id: ConnectionId) -> DebateResult<bool> {
        if !self.presence.contains(session_id, connection_id) {
            return Ok(false);
        }
        let (mut guard, session) = self.open_channel(session_id).await?;
        // Eviction may have won the race for the lock.
        let Some(participant) = self.presence.remove(session_id, connection_id) else {
            return Ok(false);
        };
        info!(session_id, connection_id, user_name = %participant.user_name, "member left");

        let announce = self.announces(&session);
        let events = self.departure(&mut guard.state, session_id, &participant.user_name, announce);
        self.fanout(&mut guard.state, session_id, events, None, announce);
        self.retire_if_idle(session_id, &session, guard);
        Ok(true)
    }

    /// Leave every session the connection belongs to. Returns how many.
    pub async fn leave_all(&self, connection_id: ConnectionId) -> usize {
        let mut left = 0;
        for session_id in self.presence.sessions_of(connection_id) {
            match self.leave(&session_id, connection_id).await {
                Ok(true) => left += 1,
                Ok(false) => {}
                Err(e) => warn!(%session_id, connection_id, "leave on disconnect failed: {e}"),
            }
        }
        left
    }

    // -- Messages ----------------------------------------------------------

    /// Accept `message` into the session's log and broadcast it to every
    /// member, sender included.
    pub async fn publish(&self, session_id: &str, message: NewMessage) -> DebateResult<Message> {
        if message.content.trim().is_empty() {
            return Err(DebateError::InvalidRequest(
                "message content must not be empty".into(),
            ));
        }

        let (mut guard, session) = self.open_channel(session_id).await?;
        if session.is_completed() {
            return Err(self.closed(session_id, &session, guard));
        }

        let stored = self.append_locked(&mut guard.state, session_id, &message)?;
        debug!(
            session_id,
            seq = stored.seq,
            origin = stored.origin_kind.as_str(),
            "message accepted"
        );
        let events = vec![ServerEvent::for_message(stored.clone())];
        self.fanout(&mut guard.state, session_id, events, None, self.announces(&session));
        Ok(stored)
    }

    /// Deliver `event` to every current member, in order with everything
    /// else happening in the session.
    pub async fn broadcast(&self, session_id: &str, event: ServerEvent) -> DebateResult<()> {
        let (mut guard, session) = self.open_channel(session_id).await?;
        self.fanout(&mut guard.state, session_id, vec![event], None, self.announces(&session));
        self.retire_if_idle(session_id, &session, guard);
        Ok(())
    }

    // -- Lifecycle ---------------------------------------------------------

    pub async fn pause(&self, session_id: &str) -> DebateResult<Session> {
        self.transition(session_id, SessionStatus::Paused).await
    }

    pub async fn resume(&self, session_id: &str) -> DebateResult<Session> {
        self.transition(session_id, SessionStatus::Active).await
    }

    pub async fn set_phase(&self, session_id: &str, phase: &str) -> DebateResult<Session> {
        let phase = phase.trim();
        if phase.is_empty() {
            return Err(DebateError::InvalidRequest("phase must not be empty".into()));
        }
        let (mut guard, session) = self.open_channel(session_id).await?;
        if session.is_completed() {
            return Err(self.closed(session_id, &session, guard));
        }

        let updated = self.store.set_phase(session_id, phase)?;
        info!(session_id, phase, "debate phase changed");
        self.publish_status(&mut guard.state, &updated);
        Ok(updated)
    }

    /// Record the committee outcome and close the session to new messages.
    pub async fn complete(&self, session_id: &str, outcome: SessionOutcome) -> DebateResult<Session> {
        let (mut guard, session) = self.open_channel(session_id).await?;
        if session.is_completed() {
            return Err(self.closed(session_id, &session, guard));
        }

        let updated = self.store.complete_session(session_id, &outcome)?;
        info!(session_id, decision = outcome.decision.as_str(), "debate completed");
        self.notifier.notify(Alert::SessionCompleted {
            session_id: session_id.to_string(),
            ticker: updated.ticker.clone(),
            decision: outcome.decision,
        });
        self.publish_status(&mut guard.state, &updated);
        self.retire_if_idle(session_id, &updated, guard);
        Ok(updated)
    }

    async fn transition(&self, session_id: &str, target: SessionStatus) -> DebateResult<Session> {
        let (mut guard, session) = self.open_channel(session_id).await?;
        if session.is_completed() {
            return Err(self.closed(session_id, &session, guard));
        }
        if !session.status.can_transition_to(target) {
            return Err(DebateError::InvalidTransition {
                id: session_id.to_string(),
                from: session.status,
                to: target,
            });
        }

        let updated = self.store.set_status(session_id, target)?;
        info!(session_id, from = %session.status, to = %target, "debate status changed");
        self.publish_status(&mut guard.state, &updated);
        Ok(updated)
    }

    fn publish_status(&self, state: &mut ChannelState, session: &Session) {
        let events = vec![ServerEvent::DebateStatus {
            session: session.clone(),
        }];
        self.fanout(state, &session.id, events, None, self.announces(session));
    }

    // -- Channel lifecycle -------------------------------------------------

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the session's channel, creating it on first use.
    async fn lock_channel(&self, session_id: &str) -> ChannelGuard {
        loop {
            let channel = Arc::clone(
                self.channels()
                    .entry(session_id.to_string())
                    .or_default(),
            );
            let state = Arc::clone(&channel).lock_owned().await;
            if !state.retired {
                return ChannelGuard { channel, state };
            }
        }
    }

    /// Lock the channel of an existing session and read its current record.
    async fn open_channel(&self, session_id: &str) -> DebateResult<(ChannelGuard, Session)> {
        // Sessions are never deleted: checking first keeps unknown ids out of
        // the channel map.
        self.session(session_id)?;
        let guard = self.lock_channel(session_id).await;
        let session = self.session(session_id)?;
        Ok((guard, session))
    }

    /// Tear down the channel of a completed session nobody is watching.
    fn retire_if_idle(&self, session_id: &str, session: &Session, guard: ChannelGuard) {
        if session.is_completed() && self.presence.count(session_id) == 0 {
            self.retire(session_id, guard);
        }
    }

    /// Rejection for a write to a completed session. The lookup that led here
    /// may have recreated a torn-down channel, so it is retired again.
    fn closed(&self, session_id: &str, session: &Session, guard: ChannelGuard) -> DebateError {
        self.retire_if_idle(session_id, session, guard);
        DebateError::SessionClosed(session_id.to_string())
    }

    fn retire(&self, session_id: &str, mut guard: ChannelGuard) {
        guard.state.retired = true;
        let mut channels = self.channels();
        if channels
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &guard.channel))
        {
            channels.remove(session_id);
        }
        debug!(session_id, "channel torn down");
    }

    // -- Ordering ----------------------------------------------------------

    fn append_locked(
        &self,
        state: &mut ChannelState,
        session_id: &str,
        message: &NewMessage,
    ) -> DebateResult<Message> {
        let cursor = match state.cursor {
            Some(cursor) => cursor,
            None => {
                let (seq, timestamp) = self.store.last_cursor(session_id)?.unwrap_or((0, 0));
                Cursor { seq, timestamp }
            }
        };
        let next = cursor.next(Utc::now().timestamp_millis());

        match self
            .store
            .append_message(session_id, message, next.seq, next.timestamp)
        {
            Ok(stored) => {
                state.cursor = Some(next);
                Ok(stored)
            }
            Err(e) => {
                // Reload from the store on the next append.
                state.cursor = None;
                Err(e.into())
            }
        }
    }

    fn announces(&self, session: &Session) -> bool {
        self.announce_presence && !session.is_completed()
    }

    /// Append a SYSTEM notice. Failures are logged, never surfaced: the
    /// membership change it describes has already happened.
    fn announcement(
        &self,
        state: &mut ChannelState,
        session_id: &str,
        text: String,
    ) -> Option<Message> {
        match self.append_locked(state, session_id, &NewMessage::system(text)) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(session_id, "failed to record presence announcement: {e}");
                None
            }
        }
    }

    // -- Delivery ----------------------------------------------------------

    /// Write the live member count through to the store.
    fn sync_count(&self, session_id: &str) -> u32 {
        let count = u32::try_from(self.presence.count(session_id)).unwrap_or(u32::MAX);
        if let Err(e) = self.store.set_participant_count(session_id, count) {
            warn!(session_id, count, "failed to store participant count: {e:#}");
        }
        count
    }

    /// Events announcing that `user_name` is gone. Presence must already be
    /// updated.
    fn departure(
        &self,
        state: &mut ChannelState,
        session_id: &str,
        user_name: &str,
        announce: bool,
    ) -> Vec<ServerEvent> {
        let mut events = vec![ServerEvent::ParticipantLeft {
            session_id: session_id.to_string(),
            user_name: user_name.to_string(),
            participant_count: self.sync_count(session_id),
        }];
        if announce {
            events.extend(
                self.announcement(state, session_id, format!("{user_name} left the debate"))
                    .map(ServerEvent::for_message),
            );
        }
        events
    }

    /// Queue `events` on every member's outbound queue, skipping `except`.
    ///
    /// Never waits on a client. A member whose queue is full or closed is
    /// evicted: removed from the session, told to close, and reported to the
    /// remaining members as having left, after the events already queued.
    fn fanout(
        &self,
        state: &mut ChannelState,
        session_id: &str,
        events: Vec<ServerEvent>,
        except: Option<ConnectionId>,
        announce: bool,
    ) {
        let mut pending: VecDeque<(ServerEvent, Option<ConnectionId>)> =
            events.into_iter().map(|event| (event, except)).collect();

        while let Some((event, except)) = pending.pop_front() {
            for member in self.presence.members(session_id) {
                if Some(member.connection_id()) == except {
                    continue;
                }
                let Err(reason) = member.connection.try_deliver(event.clone()) else {
                    continue;
                };
                if self
                    .presence
                    .remove(session_id, member.connection_id())
                    .is_none()
                {
                    continue;
                }
                self.evicted(session_id, &member, reason);
                for left in self.departure(state, session_id, &member.user_name, announce) {
                    pending.push_back((left, None));
                }
            }
        }
    }

    fn evicted(&self, session_id: &str, member: &Participant, reason: DeliveryError) {
        warn!(
            session_id,
            connection_id = member.connection_id(),
            user_name = %member.user_name,
            "evicting member: {reason}"
        );
        member.connection.disconnect();
        self.notifier.notify(Alert::MemberEvicted {
            session_id: session_id.to_string(),
            user_name: member.user_name.clone(),
        });
    }
}
