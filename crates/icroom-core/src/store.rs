// Persistence interface for debate sessions and their message log.

use anyhow::Result;

use crate::model::{Message, NewMessage, Session, SessionOutcome, SessionStatus};

/// Durable storage used by the channel hub.
///
/// Implementations only persist; they do not validate status transitions or
/// assign ordering. The hub calls every mutating method from inside the
/// session's critical section, so per-session calls never overlap.
pub trait SessionStore: Send + Sync {
    fn create_session(&self, ticker: &str, topic: &str) -> Result<Session>;

    fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// All sessions, most recently started first.
    fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Insert `message` with the given ordering and bump the session's
    /// `message_count` in the same transaction.
    fn append_message(
        &self,
        session_id: &str,
        message: &NewMessage,
        seq: i64,
        timestamp: i64,
    ) -> Result<Message>;

    /// Full history in acceptance order.
    fn load_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    /// `(seq, timestamp)` of the newest message, if any.
    fn last_cursor(&self, session_id: &str) -> Result<Option<(i64, i64)>>;

    fn set_participant_count(&self, session_id: &str, count: u32) -> Result<()>;

    /// Move between `ACTIVE` and `PAUSED`. Completion goes through
    /// [`SessionStore::complete_session`].
    fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<Session>;

    fn set_phase(&self, session_id: &str, phase: &str) -> Result<Session>;

    /// Mark the session `COMPLETED` and record the outcome. Fails if the
    /// session is already completed.
    fn complete_session(&self, session_id: &str, outcome: &SessionOutcome) -> Result<Session>;

    /// Zero every `participant_count` (presence does not survive restarts).
    /// Returns the number of sessions touched.
    fn reset_participant_counts(&self) -> Result<usize>;
}
