use crate::domain::types::MessageRole;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Durable conversation log plus additive summaries, backed by SQLite.
///
/// All operations go through one connection behind a mutex, which makes
/// appends from the loop and reads from the summary scheduler serializable.
/// Prior turns are never mutated or deleted by summarization.
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("failed to open memory store at {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create memory store directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("memory store query failed: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("conversation '{0}' does not exist")]
    UnknownConversation(String),
}

/// A turn to append. When `seq_no` is set the write is idempotent: retrying
/// the same sequence number after a crash inserts nothing new.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub seq_no: Option<u64>,
    pub role: MessageRole,
    pub content: String,
    pub tool_name: Option<String>,
}

impl NewTurn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            seq_no: None,
            role,
            content: content.into(),
            tool_name: None,
        }
    }

    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            seq_no: None,
            role: MessageRole::Tool,
            content: content.into(),
            tool_name: Some(tool_name.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRecord {
    pub seq_no: u64,
    pub role: MessageRole,
    pub content: String,
    pub tool_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub conversation_id: String,
    pub covered_through_seq_no: u64,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ConversationMeta {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn utc_now() -> String {
    Utc::now().to_rfc3339()
}

impl MemoryStore {
    pub fn open(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| MemoryError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path).map_err(|source| MemoryError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests and by deployments that opt out of a
    /// durable path.
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), MemoryError> {
        let conn = self.conn.lock().expect("memory store lock");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                 id          TEXT PRIMARY KEY,
                 title       TEXT,
                 created_at  TEXT NOT NULL,
                 updated_at  TEXT NOT NULL,
                 incognito   INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS turns (
                 conversation_id TEXT NOT NULL,
                 seq_no          INTEGER NOT NULL,
                 role            TEXT NOT NULL,
                 content         TEXT NOT NULL,
                 tool_name       TEXT,
                 created_at      TEXT NOT NULL,
                 PRIMARY KEY (conversation_id, seq_no),
                 FOREIGN KEY (conversation_id) REFERENCES conversations(id)
             );
             CREATE TABLE IF NOT EXISTS summaries (
                 id                      INTEGER PRIMARY KEY AUTOINCREMENT,
                 conversation_id         TEXT NOT NULL,
                 covered_through_seq_no  INTEGER NOT NULL,
                 summary                 TEXT NOT NULL,
                 created_at              TEXT NOT NULL,
                 FOREIGN KEY (conversation_id) REFERENCES conversations(id)
             );",
        )?;
        Ok(())
    }

    pub fn create_conversation(&self, incognito: bool) -> Result<String, MemoryError> {
        let id = Uuid::new_v4().to_string();
        let now = utc_now();
        let conn = self.conn.lock().expect("memory store lock");
        conn.execute(
            "INSERT INTO conversations (id, title, created_at, updated_at, incognito)
             VALUES (?1, NULL, ?2, ?2, ?3)",
            params![id, now, incognito as i64],
        )?;
        debug!(conversation = %id, incognito, "Conversation created");
        Ok(id)
    }

    pub fn is_incognito(&self, conversation_id: &str) -> Result<bool, MemoryError> {
        let conn = self.conn.lock().expect("memory store lock");
        let flag: Option<i64> = conn
            .query_row(
                "SELECT incognito FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        flag.map(|value| value != 0)
            .ok_or_else(|| MemoryError::UnknownConversation(conversation_id.to_string()))
    }

    /// Append a turn. Sequence numbers are assigned per conversation in
    /// insertion order. For an incognito conversation this succeeds without
    /// writing anything and returns None.
    pub fn append(&self, conversation_id: &str, turn: NewTurn) -> Result<Option<u64>, MemoryError> {
        let mut guard = self.conn.lock().expect("memory store lock");
        let tx = guard.transaction()?;

        let incognito: Option<i64> = tx
            .query_row(
                "SELECT incognito FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        match incognito {
            None => {
                return Err(MemoryError::UnknownConversation(
                    conversation_id.to_string(),
                ));
            }
            Some(flag) if flag != 0 => {
                tx.commit()?;
                return Ok(None);
            }
            Some(_) => {}
        }

        let seq_no = match turn.seq_no {
            Some(seq) => seq,
            None => {
                let max: Option<i64> = tx.query_row(
                    "SELECT MAX(seq_no) FROM turns WHERE conversation_id = ?1",
                    params![conversation_id],
                    |row| row.get(0),
                )?;
                (max.unwrap_or(0) as u64) + 1
            }
        };

        let now = utc_now();
        tx.execute(
            "INSERT OR IGNORE INTO turns (conversation_id, seq_no, role, content, tool_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id,
                seq_no as i64,
                turn.role.as_str(),
                turn.content,
                turn.tool_name,
                now
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now, conversation_id],
        )?;
        tx.commit()?;
        Ok(Some(seq_no))
    }

    /// All turns of a conversation in sequence order.
    pub fn turns(&self, conversation_id: &str) -> Result<Vec<TurnRecord>, MemoryError> {
        self.turns_after(conversation_id, 0)
    }

    /// Turns appended since the latest committed summary's covered range.
    pub fn read_unsummarized(&self, conversation_id: &str) -> Result<Vec<TurnRecord>, MemoryError> {
        let covered = self
            .latest_summary(conversation_id)?
            .map(|summary| summary.covered_through_seq_no)
            .unwrap_or(0);
        self.turns_after(conversation_id, covered)
    }

    fn turns_after(
        &self,
        conversation_id: &str,
        after_seq: u64,
    ) -> Result<Vec<TurnRecord>, MemoryError> {
        let conn = self.conn.lock().expect("memory store lock");
        let mut stmt = conn.prepare(
            "SELECT seq_no, role, content, tool_name, created_at
             FROM turns
             WHERE conversation_id = ?1 AND seq_no > ?2
             ORDER BY seq_no ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id, after_seq as i64], |row| {
            let seq_no: i64 = row.get(0)?;
            let role: String = row.get(1)?;
            Ok(TurnRecord {
                seq_no: seq_no as u64,
                role: MessageRole::from_str(&role).unwrap_or(MessageRole::User),
                content: row.get(2)?,
                tool_name: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Latest summary for a conversation, or None before the first commit.
    pub fn latest_summary(&self, conversation_id: &str) -> Result<Option<Summary>, MemoryError> {
        let conn = self.conn.lock().expect("memory store lock");
        let summary = conn
            .query_row(
                "SELECT covered_through_seq_no, summary, created_at
                 FROM summaries
                 WHERE conversation_id = ?1
                 ORDER BY id DESC
                 LIMIT 1",
                params![conversation_id],
                |row| {
                    let covered: i64 = row.get(0)?;
                    Ok(Summary {
                        conversation_id: conversation_id.to_string(),
                        covered_through_seq_no: covered as u64,
                        text: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(summary)
    }

    /// Insert a new summary record. Summaries are additive: earlier records
    /// are superseded, never overwritten. No-op for incognito conversations.
    pub fn commit_summary(
        &self,
        conversation_id: &str,
        covered_through_seq_no: u64,
        text: &str,
    ) -> Result<(), MemoryError> {
        if self.is_incognito(conversation_id)? {
            return Ok(());
        }
        let conn = self.conn.lock().expect("memory store lock");
        conn.execute(
            "INSERT INTO summaries (conversation_id, covered_through_seq_no, summary, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation_id,
                covered_through_seq_no as i64,
                text,
                utc_now()
            ],
        )?;
        debug!(
            conversation = %conversation_id,
            covered_through = covered_through_seq_no,
            "Summary committed"
        );
        Ok(())
    }

    /// Conversations that currently hold turns beyond their latest summary.
    /// Incognito conversations never appear here.
    pub fn unsummarized_conversations(&self) -> Result<Vec<String>, MemoryError> {
        let conn = self.conn.lock().expect("memory store lock");
        let mut stmt = conn.prepare(
            "SELECT c.id FROM conversations c
             WHERE c.incognito = 0
               AND EXISTS (
                   SELECT 1 FROM turns t
                   WHERE t.conversation_id = c.id
                     AND t.seq_no > COALESCE(
                         (SELECT MAX(s.covered_through_seq_no)
                          FROM summaries s
                          WHERE s.conversation_id = c.id), 0)
               )
             ORDER BY c.updated_at ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_title(&self, conversation_id: &str) -> Result<Option<String>, MemoryError> {
        let conn = self.conn.lock().expect("memory store lock");
        let title: Option<Option<String>> = conn
            .query_row(
                "SELECT title FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(title.flatten())
    }

    pub fn update_title(&self, conversation_id: &str, title: &str) -> Result<(), MemoryError> {
        let conn = self.conn.lock().expect("memory store lock");
        conn.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, utc_now(), conversation_id],
        )?;
        Ok(())
    }

    /// Most recently updated conversations, optionally filtered by a search
    /// term matched against titles and turn contents.
    pub fn list_conversations(
        &self,
        search: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConversationMeta>, MemoryError> {
        let conn = self.conn.lock().expect("memory store lock");
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(ConversationMeta {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        };

        let rows = if let Some(term) = search {
            let like = format!("%{term}%");
            let mut stmt = conn.prepare(
                "SELECT DISTINCT c.id, c.title, c.created_at, c.updated_at
                 FROM conversations c
                 LEFT JOIN turns t ON t.conversation_id = c.id
                 WHERE c.title LIKE ?1 OR t.content LIKE ?1
                 ORDER BY c.updated_at DESC
                 LIMIT ?2",
            )?;
            let mapped = stmt.query_map(params![like, limit as i64], map_row)?;
            mapped.collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, title, created_at, updated_at
                 FROM conversations
                 ORDER BY updated_at DESC
                 LIMIT ?1",
            )?;
            let mapped = stmt.query_map(params![limit as i64], map_row)?;
            mapped.collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    /// Remove a conversation and all related records.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), MemoryError> {
        let mut guard = self.conn.lock().expect("memory store lock");
        let tx = guard.transaction()?;
        tx.execute(
            "DELETE FROM turns WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.execute(
            "DELETE FROM summaries WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![conversation_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}
