// SQLite persistence layer for debate sessions and messages.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{
    Decision, Message, MessageType, NewMessage, OriginKind, Session, SessionOutcome,
    SessionStatus, Stance,
};
use crate::store::SessionStore;

/// Column list shared by every session query; `session_from_row` depends on
/// this order.
const SESSION_COLUMNS: &str = "id, ticker, topic, status, current_phase, participant_count,
     message_count, started_at, ended_at, decision, summary, key_points";

const MESSAGE_COLUMNS: &str = "id, session_id, seq, sender_id, sender_name, origin_kind,
     content, message_type, stance, request_id, timestamp";

/// Phase label given to newly created sessions.
pub const INITIAL_PHASE: &str = "opening";

/// SQLite-backed store for debate sessions and their message log.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS debate_sessions (
                id                TEXT PRIMARY KEY,
                ticker            TEXT NOT NULL,
                topic             TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'ACTIVE',
                current_phase     TEXT NOT NULL DEFAULT 'opening',
                participant_count INTEGER NOT NULL DEFAULT 0,
                message_count     INTEGER NOT NULL DEFAULT 0,
                started_at        TEXT NOT NULL,
                ended_at          TEXT,
                decision          TEXT,
                summary           TEXT,
                key_points        TEXT
            );

            CREATE TABLE IF NOT EXISTS debate_messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id   TEXT NOT NULL REFERENCES debate_sessions(id),
                seq          INTEGER NOT NULL,
                sender_id    TEXT NOT NULL,
                sender_name  TEXT NOT NULL,
                origin_kind  TEXT NOT NULL,
                content      TEXT NOT NULL,
                message_type TEXT NOT NULL,
                stance       TEXT,
                request_id   TEXT,
                timestamp    INTEGER NOT NULL,
                UNIQUE(session_id, seq)
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }

    /// Generate a new opaque session identifier.
    pub fn generate_session_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn load_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM debate_sessions WHERE id = ?1"),
            params![session_id],
            session_from_row,
        )
        .optional()
        .context("failed to load debate session")
    }

    fn require_session(conn: &Connection, session_id: &str) -> Result<Session> {
        Self::load_session(conn, session_id)?
            .ok_or_else(|| anyhow!("debate session {session_id} does not exist"))
    }
}

impl SessionStore for Database {
    fn create_session(&self, ticker: &str, topic: &str) -> Result<Session> {
        let conn = self.conn()?;
        let id = Self::generate_session_id();
        let started_at = format_time(Utc::now());
        conn.execute(
            "INSERT INTO debate_sessions (id, ticker, topic, status, current_phase, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                ticker,
                topic,
                SessionStatus::Active.as_str(),
                INITIAL_PHASE,
                started_at
            ],
        )
        .context("failed to create debate session")?;
        Self::require_session(&conn, &id)
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn()?;
        Self::load_session(&conn, session_id)
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM debate_sessions ORDER BY started_at DESC, rowid DESC"
            ))
            .context("failed to prepare list_sessions query")?;
        let sessions = stmt
            .query_map([], session_from_row)
            .context("failed to query debate sessions")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map debate session rows")?;
        Ok(sessions)
    }

    fn append_message(
        &self,
        session_id: &str,
        message: &NewMessage,
        seq: i64,
        timestamp: i64,
    ) -> Result<Message> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("failed to begin append transaction")?;

        tx.execute(
            "INSERT INTO debate_messages
                (session_id, seq, sender_id, sender_name, origin_kind, content, message_type, stance, request_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session_id,
                seq,
                message.sender_id,
                message.sender_name,
                message.origin_kind.as_str(),
                message.content,
                message.message_type.as_str(),
                message.stance.map(Stance::as_str),
                message.request_id,
                timestamp,
            ],
        )
        .context("failed to insert debate message")?;
        let id = tx.last_insert_rowid();

        let updated = tx
            .execute(
                "UPDATE debate_sessions SET message_count = message_count + 1 WHERE id = ?1",
                params![session_id],
            )
            .context("failed to bump message_count")?;
        if updated == 0 {
            bail!("debate session {session_id} does not exist");
        }

        tx.commit().context("failed to commit appended message")?;

        Ok(Message {
            id,
            session_id: session_id.to_string(),
            seq,
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            origin_kind: message.origin_kind,
            content: message.content.clone(),
            message_type: message.message_type,
            stance: message.stance,
            request_id: message.request_id.clone(),
            timestamp,
        })
    }

    fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM debate_messages WHERE session_id = ?1 ORDER BY seq"
            ))
            .context("failed to prepare load_messages query")?;

        let messages = stmt
            .query_map(params![session_id], message_from_row)
            .context("failed to query debate messages")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map debate message rows")?;

        Ok(messages)
    }

    fn last_cursor(&self, session_id: &str) -> Result<Option<(i64, i64)>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT seq, timestamp FROM debate_messages
             WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("failed to read last message cursor")
    }

    fn set_participant_count(&self, session_id: &str, count: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE debate_sessions SET participant_count = ?2 WHERE id = ?1",
            params![session_id, count],
        )
        .context("failed to update participant_count")?;
        Ok(())
    }

    fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<Session> {
        if status == SessionStatus::Completed {
            bail!("completion must record an outcome; use complete_session");
        }
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE debate_sessions SET status = ?2 WHERE id = ?1 AND status != ?3",
                params![
                    session_id,
                    status.as_str(),
                    SessionStatus::Completed.as_str()
                ],
            )
            .context("failed to update session status")?;
        if updated == 0 {
            bail!("debate session {session_id} is missing or completed");
        }
        Self::require_session(&conn, session_id)
    }

    fn set_phase(&self, session_id: &str, phase: &str) -> Result<Session> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE debate_sessions SET current_phase = ?2 WHERE id = ?1",
                params![session_id, phase],
            )
            .context("failed to update session phase")?;
        if updated == 0 {
            bail!("debate session {session_id} does not exist");
        }
        Self::require_session(&conn, session_id)
    }

    fn complete_session(&self, session_id: &str, outcome: &SessionOutcome) -> Result<Session> {
        let conn = self.conn()?;
        let key_points_json = serde_json::to_string(&outcome.key_points)
            .context("failed to serialize key_points")?;
        let updated = conn
            .execute(
                "UPDATE debate_sessions
                 SET status = ?2, ended_at = ?3, decision = ?4, summary = ?5, key_points = ?6
                 WHERE id = ?1 AND status != ?2",
                params![
                    session_id,
                    SessionStatus::Completed.as_str(),
                    format_time(Utc::now()),
                    outcome.decision.as_str(),
                    outcome.summary,
                    key_points_json,
                ],
            )
            .context("failed to complete debate session")?;
        if updated == 0 {
            bail!("debate session {session_id} is missing or already completed");
        }
        Self::require_session(&conn, session_id)
    }

    fn reset_participant_counts(&self) -> Result<usize> {
        let conn = self.conn()?;
        let touched = conn
            .execute(
                "UPDATE debate_sessions SET participant_count = 0 WHERE participant_count != 0",
                [],
            )
            .context("failed to reset participant counts")?;
        Ok(touched)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unrecognised value {raw:?}").into(),
    )
}

fn parse_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, &raw))
}

fn parse_optional_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse(&s).ok_or_else(|| conversion_error(idx, &s)))
        .transpose()
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let key_points_json: Option<String> = row.get(11)?;
    let key_points = key_points_json
        .map(|json| {
            serde_json::from_str::<Vec<String>>(&json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e))
            })
        })
        .transpose()?;

    Ok(Session {
        id: row.get(0)?,
        ticker: row.get(1)?,
        topic: row.get(2)?,
        status: parse_column(row, 3, SessionStatus::parse)?,
        current_phase: row.get(4)?,
        participant_count: row.get(5)?,
        message_count: row.get(6)?,
        started_at: parse_column(row, 7, parse_time)?,
        ended_at: parse_optional_column(row, 8, parse_time)?,
        decision: parse_optional_column(row, 9, Decision::parse)?,
        summary: row.get(10)?,
        key_points,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        sender_id: row.get(3)?,
        sender_name: row.get(4)?,
        origin_kind: parse_column(row, 5, OriginKind::parse)?,
        content: row.get(6)?,
        message_type: parse_column(row, 7, MessageType::parse)?,
        stance: parse_optional_column(row, 8, Stance::parse)?,
        request_id: row.get(9)?,
        timestamp: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: create a fresh in-memory database for each test.
    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    fn text(sender: &str, content: &str) -> NewMessage {
        NewMessage::human(sender, sender, content, MessageType::Text)
    }

    // ------------------------------------------------------------------
    // Schema / open
    // ------------------------------------------------------------------

    #[test]
    fn open_creates_tables() {
        let db = test_db();
        let conn = db.conn().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"debate_sessions".to_string()));
        assert!(tables.contains(&"debate_messages".to_string()));
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    #[test]
    fn create_session_starts_active_with_zero_counters() {
        let db = test_db();
        let session = db.create_session("NVDA", "Add to core position?").unwrap();

        assert_eq!(session.ticker, "NVDA");
        assert_eq!(session.topic, "Add to core position?");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.current_phase, INITIAL_PHASE);
        assert_eq!(session.participant_count, 0);
        assert_eq!(session.message_count, 0);
        assert!(session.ended_at.is_none());
        assert!(session.decision.is_none());
        assert!(session.summary.is_none());
        assert!(session.key_points.is_none());

        let loaded = db.get_session(&session.id).unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn get_unknown_session_returns_none() {
        let db = test_db();
        assert!(db.get_session("nope").unwrap().is_none());
    }

    #[test]
    fn list_sessions_returns_all() {
        let db = test_db();
        let a = db.create_session("AAPL", "a").unwrap();
        let b = db.create_session("MSFT", "b").unwrap();
        let ids: Vec<String> = db.list_sessions().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    #[test]
    fn append_bumps_message_count_and_preserves_order() {
        let db = test_db();
        let s = db.create_session("NVDA", "t").unwrap();

        let first = db.append_message(&s.id, &text("user-1", "first"), 1, 1_000).unwrap();
        let second = db.append_message(&s.id, &text("user-2", "second"), 2, 1_001).unwrap();
        assert!(second.id > first.id);

        let history = db.load_messages(&s.id).unwrap();
        assert_eq!(history, vec![first, second]);
        assert_eq!(db.get_session(&s.id).unwrap().unwrap().message_count, 2);
        assert_eq!(db.last_cursor(&s.id).unwrap(), Some((2, 1_001)));
    }

    #[test]
    fn agent_fields_round_trip() {
        let db = test_db();
        let s = db.create_session("NVDA", "t").unwrap();
        let draft = NewMessage {
            sender_id: "contrarian_agent".into(),
            sender_name: "Contrarian Agent".into(),
            origin_kind: OriginKind::Agent,
            content: "Valuation is stretched.".into(),
            message_type: MessageType::Analysis,
            stance: Some(Stance::Bear),
            request_id: Some("req-1".into()),
        };
        db.append_message(&s.id, &draft, 1, 5).unwrap();

        let loaded = &db.load_messages(&s.id).unwrap()[0];
        assert_eq!(loaded.origin_kind, OriginKind::Agent);
        assert_eq!(loaded.message_type, MessageType::Analysis);
        assert_eq!(loaded.stance, Some(Stance::Bear));
        assert_eq!(loaded.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn duplicate_seq_is_rejected_and_count_unchanged() {
        let db = test_db();
        let s = db.create_session("NVDA", "t").unwrap();
        db.append_message(&s.id, &text("u", "one"), 1, 1).unwrap();
        assert!(db.append_message(&s.id, &text("u", "dup"), 1, 2).is_err());

        assert_eq!(db.load_messages(&s.id).unwrap().len(), 1);
        assert_eq!(db.get_session(&s.id).unwrap().unwrap().message_count, 1);
    }

    #[test]
    fn append_to_unknown_session_fails() {
        let db = test_db();
        assert!(db.append_message("ghost", &text("u", "x"), 1, 1).is_err());
    }

    #[test]
    fn empty_session_has_no_cursor() {
        let db = test_db();
        let s = db.create_session("NVDA", "t").unwrap();
        assert_eq!(db.last_cursor(&s.id).unwrap(), None);
        assert!(db.load_messages(&s.id).unwrap().is_empty());
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[test]
    fn set_status_and_phase() {
        let db = test_db();
        let s = db.create_session("NVDA", "t").unwrap();

        let paused = db.set_status(&s.id, SessionStatus::Paused).unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        let rebuttal = db.set_phase(&s.id, "rebuttal").unwrap();
        assert_eq!(rebuttal.current_phase, "rebuttal");
        assert_eq!(rebuttal.status, SessionStatus::Paused);
    }

    #[test]
    fn set_status_refuses_completion() {
        let db = test_db();
        let s = db.create_session("NVDA", "t").unwrap();
        assert!(db.set_status(&s.id, SessionStatus::Completed).is_err());
        assert_eq!(
            db.get_session(&s.id).unwrap().unwrap().status,
            SessionStatus::Active
        );
    }

    #[test]
    fn complete_session_records_outcome_once() {
        let db = test_db();
        let s = db.create_session("NVDA", "t").unwrap();
        let outcome = SessionOutcome {
            decision: Decision::Approved,
            summary: Some("Approve a 2% starter position.".into()),
            key_points: vec!["Data-center demand".into(), "Margin risk".into()],
        };

        let done = db.complete_session(&s.id, &outcome).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.decision, Some(Decision::Approved));
        assert_eq!(done.summary.as_deref(), Some("Approve a 2% starter position."));
        assert_eq!(done.key_points.as_ref().map(Vec::len), Some(2));
        assert!(done.ended_at.is_some());

        let again = SessionOutcome {
            decision: Decision::Rejected,
            summary: None,
            key_points: vec![],
        };
        assert!(db.complete_session(&s.id, &again).is_err());
        let reloaded = db.get_session(&s.id).unwrap().unwrap();
        assert_eq!(reloaded.decision, Some(Decision::Approved));
        assert!(db.set_status(&s.id, SessionStatus::Active).is_err());
    }

    #[test]
    fn reset_participant_counts_zeroes_stale_gauges() {
        let db = test_db();
        let a = db.create_session("AAPL", "a").unwrap();
        let b = db.create_session("MSFT", "b").unwrap();
        db.set_participant_count(&a.id, 3).unwrap();

        assert_eq!(db.reset_participant_counts().unwrap(), 1);
        assert_eq!(db.get_session(&a.id).unwrap().unwrap().participant_count, 0);
        assert_eq!(db.get_session(&b.id).unwrap().unwrap().participant_count, 0);
    }
}
