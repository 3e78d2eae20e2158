//! Session and message repository
//!
//! Messages are keyed by `(session_id, ordinal)`. Ordinals are assigned
//! at append time, strictly increasing and gap-free per session, and are
//! never reused. While a message is `pending`, `append_or_update`
//! overwrites the same slot so a concurrent reader always observes the
//! latest consistent snapshot; `finalize` is a terminal transition after
//! which the content is immutable. Violating any of these rules is a
//! programming error and surfaces as [`Error::Storage`].

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use uuid::Uuid;

use super::DbPool;
use crate::{Error, Result};

/// Title given to sessions before the first user message names them
pub const DEFAULT_SESSION_TITLE: &str = "New conversation";

/// A conversation session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A message in a session
#[derive(Debug, Clone)]
pub struct Message {
    pub session_id: String,
    pub ordinal: i64,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Message lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// Content is still being built; the only mutable state
    Pending,
    /// Finished normally
    Complete,
    /// A collaborator failed mid-build; partial content retained
    Failed,
    /// Stopped by user barge-in; partial content retained
    Interrupted,
}

impl MessageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// Whether this status is terminal
    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Session and message repository
#[derive(Debug, Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new repository over a connection pool
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Create a new session
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn create_session(&self, title: &str) -> Result<Session> {
        let conn = self.conn()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO sessions (id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![&id, title, now.to_rfc3339()],
        )?;

        tracing::info!(session = %id, title, "session created");

        Ok(Session {
            id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch a session by id
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the session does not exist
    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?1",
            [session_id],
            row_to_session,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// List sessions, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at
             FROM sessions ORDER BY updated_at DESC",
        )?;

        let sessions = stmt
            .query_map([], row_to_session)?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(sessions)
    }

    /// Rename a session
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the session does not exist
    pub fn rename_session(&self, session_id: &str, title: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), session_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    /// Delete a session and all of its messages
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        tracing::info!(session = %session_id, "session deleted");
        Ok(())
    }

    /// Search sessions by title or message content
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn search_sessions(&self, query: &str, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn()?;
        let pattern = format!("%{query}%");
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.id, s.title, s.created_at, s.updated_at
             FROM sessions s
             LEFT JOIN messages m ON s.id = m.session_id
             WHERE s.title LIKE ?1 OR m.content LIKE ?1
             ORDER BY s.updated_at DESC
             LIMIT ?2",
        )?;

        #[allow(clippy::cast_possible_wrap)]
        let sessions = stmt
            .query_map(params![pattern, limit as i64], row_to_session)?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(sessions)
    }

    /// Next unassigned ordinal for a session
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn next_ordinal(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ordinal), 0) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(max + 1)
    }

    /// Write a message slot: insert a new ordinal or overwrite a pending one.
    ///
    /// A new ordinal must be exactly one past the current maximum, and a
    /// `pending` write requires that no other message of the session is
    /// pending. Overwriting is only allowed while the existing slot is
    /// `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on any ordering/status invariant
    /// violation and [`Error::NotFound`] for an unknown session
    pub fn append_or_update(
        &self,
        session_id: &str,
        ordinal: i64,
        role: MessageRole,
        content: &str,
        status: MessageStatus,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        session_exists(&tx, session_id)?;
        let now = Utc::now().to_rfc3339();

        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM messages WHERE session_id = ?1 AND ordinal = ?2",
                params![session_id, ordinal],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(current) = existing {
            let current = MessageStatus::from_str(&current)
                .ok_or_else(|| Error::Database(format!("unknown message status: {current}")))?;
            if current.is_final() {
                return Err(Error::Storage(format!(
                    "message {ordinal} of session {session_id} is finalized and immutable"
                )));
            }

            tx.execute(
                "UPDATE messages SET content = ?1, status = ?2
                 WHERE session_id = ?3 AND ordinal = ?4",
                params![content, status.as_str(), session_id, ordinal],
            )?;
        } else {
            let max: i64 = tx.query_row(
                "SELECT COALESCE(MAX(ordinal), 0) FROM messages WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )?;
            if ordinal != max + 1 {
                return Err(Error::Storage(format!(
                    "ordinal {ordinal} would leave a gap in session {session_id} (expected {})",
                    max + 1
                )));
            }

            if status == MessageStatus::Pending {
                let pending: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM messages
                     WHERE session_id = ?1 AND status = 'pending'",
                    [session_id],
                    |row| row.get(0),
                )?;
                if pending > 0 {
                    return Err(Error::Storage(format!(
                        "session {session_id} already has a pending message"
                    )));
                }
            }

            tx.execute(
                "INSERT INTO messages (session_id, ordinal, role, content, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![session_id, ordinal, role.as_str(), content, status.as_str(), &now],
            )?;
        }

        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![&now, session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Finalize a pending message with a terminal status
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the slot is missing, already
    /// finalized, or `status` is not terminal
    pub fn finalize(
        &self,
        session_id: &str,
        ordinal: i64,
        status: MessageStatus,
    ) -> Result<()> {
        if !status.is_final() {
            return Err(Error::Storage(format!(
                "finalize requires a terminal status, got {}",
                status.as_str()
            )));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM messages WHERE session_id = ?1 AND ordinal = ?2",
                params![session_id, ordinal],
                |row| row.get(0),
            )
            .optional()?;

        let current = current.ok_or_else(|| {
            Error::Storage(format!(
                "cannot finalize missing message {ordinal} of session {session_id}"
            ))
        })?;
        let current = MessageStatus::from_str(&current)
            .ok_or_else(|| Error::Database(format!("unknown message status: {current}")))?;
        if current.is_final() {
            return Err(Error::Storage(format!(
                "message {ordinal} of session {session_id} is already finalized"
            )));
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE messages SET status = ?1 WHERE session_id = ?2 AND ordinal = ?3",
            params![status.as_str(), session_id, ordinal],
        )?;
        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![&now, session_id],
        )?;
        tx.commit()?;

        tracing::debug!(
            session = %session_id,
            ordinal,
            status = status.as_str(),
            "message finalized"
        );
        Ok(())
    }

    /// Ordered message history of a session
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn read_history(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, ordinal, role, content, status, created_at
             FROM messages WHERE session_id = ?1
             ORDER BY ordinal ASC",
        )?;

        let messages = stmt
            .query_map([session_id], |row| {
                Ok(Message {
                    session_id: row.get(0)?,
                    ordinal: row.get(1)?,
                    role: MessageRole::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or(MessageRole::User),
                    content: row.get(3)?,
                    status: MessageStatus::from_str(&row.get::<_, String>(4)?)
                        .unwrap_or(MessageStatus::Complete),
                    created_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            })?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(messages)
    }

    /// Number of messages in a session
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn message_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Number of pending messages in a session (0 or 1 when invariants hold)
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails
    pub fn pending_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND status = 'pending'",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn session_exists(tx: &Transaction<'_>, session_id: &str) -> Result<()> {
    let found: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sessions WHERE id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    if found == 0 {
        return Err(Error::NotFound(format!("session {session_id}")));
    }
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: parse_datetime(&row.get::<_, String>(2)?),
        updated_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
