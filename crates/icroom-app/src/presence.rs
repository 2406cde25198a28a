// In-memory record of which connections are members of which sessions.
//
// Never persisted; after a restart clients re-join. The hub mutates it only
// while holding the affected session's lock, so membership changes of one
// session are ordered with that session's messages.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use icroom_core::ws_server::{ConnectionHandle, ConnectionId};

/// One connection's membership in one session.
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection: ConnectionHandle,
    pub session_id: String,
    pub user_name: String,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(
        connection: ConnectionHandle,
        session_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            session_id: session_id.into(),
            user_name: user_name.into(),
            joined_at: Utc::now(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }
}

/// session id -> (connection id -> participant).
#[derive(Debug, Default)]
pub struct PresenceTracker {
    sessions: Mutex<HashMap<String, HashMap<ConnectionId, Participant>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<ConnectionId, Participant>>> {
        // No invariant spans more than one map operation, so a poisoned lock
        // still holds consistent data.
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `participant`. Returns `false` (and keeps the existing entry)
    /// when the connection is already a member of the session.
    pub fn add(&self, participant: Participant) -> bool {
        let mut sessions = self.lock();
        let members = sessions.entry(participant.session_id.clone()).or_default();
        let connection_id = participant.connection_id();
        if members.contains_key(&connection_id) {
            return false;
        }
        members.insert(connection_id, participant);
        true
    }

    pub fn remove(&self, session_id: &str, connection_id: ConnectionId) -> Option<Participant> {
        let mut sessions = self.lock();
        let members = sessions.get_mut(session_id)?;
        let removed = members.remove(&connection_id);
        if members.is_empty() {
            sessions.remove(session_id);
        }
        removed
    }

    pub fn contains(&self, session_id: &str, connection_id: ConnectionId) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|members| members.contains_key(&connection_id))
    }

    pub fn count(&self, session_id: &str) -> usize {
        self.lock().get(session_id).map_or(0, HashMap::len)
    }

    /// Snapshot of the session's members, oldest join first.
    pub fn members(&self, session_id: &str) -> Vec<Participant> {
        let mut members: Vec<Participant> = self
            .lock()
            .get(session_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        members.sort_by_key(|p| (p.joined_at, p.connection_id()));
        members
    }

    /// Sessions the connection is currently a member of.
    pub fn sessions_of(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, members)| members.contains_key(&connection_id))
            .map(|(session_id, _)| session_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of memberships across all sessions.
    pub fn total(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(id: ConnectionId) -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(1);
        ConnectionHandle::new(id, tx)
    }

    #[test]
    fn add_is_idempotent_per_connection() {
        let presence = PresenceTracker::new();
        assert!(presence.add(Participant::new(handle(1), "s1", "Ana")));
        assert!(!presence.add(Participant::new(handle(1), "s1", "Ana again")));
        assert_eq!(presence.count("s1"), 1);
        assert_eq!(presence.members("s1")[0].user_name, "Ana");
    }

    #[test]
    fn same_connection_may_join_several_sessions() {
        let presence = PresenceTracker::new();
        presence.add(Participant::new(handle(1), "s1", "Ana"));
        presence.add(Participant::new(handle(1), "s2", "Ana"));
        presence.add(Participant::new(handle(2), "s2", "Ben"));

        assert_eq!(presence.sessions_of(1), vec!["s1", "s2"]);
        assert_eq!(presence.sessions_of(2), vec!["s2"]);
        assert_eq!(presence.total(), 3);
    }

    #[test]
    fn remove_prunes_empty_sessions() {
        let presence = PresenceTracker::new();
        presence.add(Participant::new(handle(1), "s1", "Ana"));

        let removed = presence.remove("s1", 1).expect("member should be removed");
        assert_eq!(removed.user_name, "Ana");
        assert!(!presence.contains("s1", 1));
        assert_eq!(presence.count("s1"), 0);
        assert!(presence.sessions_of(1).is_empty());
        assert_eq!(presence.total(), 0);
    }

    #[test]
    fn remove_unknown_member_is_none() {
        let presence = PresenceTracker::new();
        presence.add(Participant::new(handle(1), "s1", "Ana"));
        assert!(presence.remove("s1", 2).is_none());
        assert!(presence.remove("nope", 1).is_none());
        assert_eq!(presence.count("s1"), 1);
    }
}
