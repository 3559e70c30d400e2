//! SQLite-backed queue store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::{Member, MessageHandle, Queue, QueueId};
use crate::error::{Error, Result};

use super::QueueStore;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS queues (
        queue_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        chat_id INTEGER NOT NULL,
        chat_message_id INTEGER,
        expires_at INTEGER NOT NULL,
        last_position INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS members (
        queue_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        display_name TEXT NOT NULL,
        position INTEGER NOT NULL,
        PRIMARY KEY (queue_id, user_id),
        UNIQUE (queue_id, position)
    );
    CREATE INDEX IF NOT EXISTS idx_queues_chat ON queues(chat_id);
    CREATE INDEX IF NOT EXISTS idx_members_user ON members(user_id);
"#;

const QUEUE_COLUMNS: &str =
    "q.queue_id, q.name, q.chat_id, q.chat_message_id, q.expires_at, q.last_position";

/// Queue row as stored, before timestamp conversion.
struct QueueRow {
    id: QueueId,
    name: String,
    chat_id: i64,
    message_id: Option<i32>,
    expires_at_ms: i64,
    last_position: i64,
}

impl QueueRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            chat_id: row.get(2)?,
            message_id: row.get(3)?,
            expires_at_ms: row.get(4)?,
            last_position: row.get(5)?,
        })
    }

    fn into_queue(self) -> Result<Queue> {
        let expires_at = DateTime::<Utc>::from_timestamp_millis(self.expires_at_ms).ok_or_else(|| {
            Error::Storage(format!(
                "queue {} has out-of-range deadline {}",
                self.id, self.expires_at_ms
            ))
        })?;

        Ok(Queue {
            id: self.id,
            name: self.name,
            chat_id: self.chat_id,
            expires_at,
            announcement: self.message_id.map(|message_id| MessageHandle {
                chat_id: self.chat_id,
                message_id,
            }),
            last_position: self.last_position,
        })
    }
}

/// Queue store over a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and create if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("sqlite open {}: {}", path.display(), e)))?;
        tracing::debug!("Opened queue database at {}", path.display());
        Self::init(conn)
    }

    /// Private database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("sqlite open memory: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Storage(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection poisoned".to_string()))
    }

    fn query_queues(&self, sql: &str, param: Option<i64>) -> Result<Vec<Queue>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Storage(format!("sqlite prepare queues: {}", e)))?;
        let rows = match param {
            Some(p) => stmt.query_map(params![p], QueueRow::read),
            None => stmt.query_map([], QueueRow::read),
        }
        .map_err(|e| Error::Storage(format!("sqlite query queues: {}", e)))?;

        let mut queues = Vec::new();
        for row in rows {
            let row = row.map_err(|e| Error::Storage(format!("sqlite read queue: {}", e)))?;
            queues.push(row.into_queue()?);
        }
        Ok(queues)
    }
}

impl QueueStore for SqliteStore {
    fn next_queue_id(&self) -> Result<QueueId> {
        let conn = self.conn()?;
        let max: Option<i64> = conn
            .query_row("SELECT MAX(queue_id) FROM queues", [], |row| row.get(0))
            .map_err(|e| Error::Storage(format!("sqlite max queue id: {}", e)))?;
        Ok(max.map_or(0, |id| id + 1))
    }

    fn load_queue(&self, id: QueueId) -> Result<Option<Queue>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM queues q WHERE q.queue_id = ?1", QUEUE_COLUMNS),
                params![id],
                QueueRow::read,
            )
            .optional()
            .map_err(|e| Error::Storage(format!("sqlite load queue: {}", e)))?;
        row.map(QueueRow::into_queue).transpose()
    }

    fn load_members(&self, id: QueueId) -> Result<Vec<Member>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT queue_id, user_id, display_name, position FROM members WHERE queue_id = ?1",
            )
            .map_err(|e| Error::Storage(format!("sqlite prepare members: {}", e)))?;
        let members = stmt
            .query_map(params![id], |row| {
                Ok(Member {
                    queue_id: row.get(0)?,
                    user_id: row.get(1)?,
                    display_name: row.get(2)?,
                    position: row.get(3)?,
                })
            })
            .map_err(|e| Error::Storage(format!("sqlite query members: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("sqlite read member: {}", e)))?;
        Ok(members)
    }

    fn list_queues(&self) -> Result<Vec<Queue>> {
        self.query_queues(
            &format!("SELECT {} FROM queues q ORDER BY q.queue_id", QUEUE_COLUMNS),
            None,
        )
    }

    fn queues_in_chat(&self, chat_id: i64) -> Result<Vec<Queue>> {
        self.query_queues(
            &format!(
                "SELECT {} FROM queues q WHERE q.chat_id = ?1 ORDER BY q.queue_id",
                QUEUE_COLUMNS
            ),
            Some(chat_id),
        )
    }

    fn queues_for_user(&self, user_id: i64) -> Result<Vec<Queue>> {
        self.query_queues(
            &format!(
                "SELECT {} FROM queues q JOIN members m ON m.queue_id = q.queue_id \
                 WHERE m.user_id = ?1 ORDER BY q.queue_id",
                QUEUE_COLUMNS
            ),
            Some(user_id),
        )
    }

    fn save_queue(&self, queue: &Queue) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO queues (queue_id, name, chat_id, chat_message_id, expires_at, last_position) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(queue_id) DO UPDATE SET name = excluded.name, chat_id = excluded.chat_id, \
             chat_message_id = excluded.chat_message_id, expires_at = excluded.expires_at, \
             last_position = excluded.last_position",
            params![
                queue.id,
                queue.name,
                queue.chat_id,
                queue.announcement.map(|h| h.message_id),
                queue.expires_at.timestamp_millis(),
                queue.last_position
            ],
        )
        .map_err(|e| Error::Storage(format!("sqlite save queue: {}", e)))?;
        Ok(())
    }

    fn save_members(&self, members: &[Member]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("sqlite begin: {}", e)))?;

        // Park existing rows on negative positions first so an exchange of
        // positions never trips UNIQUE(queue_id, position) halfway through.
        for m in members {
            tx.execute(
                "UPDATE members SET position = ?1 WHERE queue_id = ?2 AND user_id = ?3",
                params![-m.position, m.queue_id, m.user_id],
            )
            .map_err(|e| Error::Storage(format!("sqlite park member: {}", e)))?;
        }
        for m in members {
            tx.execute(
                "INSERT INTO members (queue_id, user_id, display_name, position) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(queue_id, user_id) DO UPDATE SET display_name = excluded.display_name, \
                 position = excluded.position",
                params![m.queue_id, m.user_id, m.display_name, m.position],
            )
            .map_err(|e| Error::Storage(format!("sqlite save member: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| Error::Storage(format!("sqlite commit members: {}", e)))?;
        Ok(())
    }

    fn remove_member(&self, queue_id: QueueId, user_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM members WHERE queue_id = ?1 AND user_id = ?2",
                params![queue_id, user_id],
            )
            .map_err(|e| Error::Storage(format!("sqlite remove member: {}", e)))?;
        Ok(removed > 0)
    }

    fn delete_queue(&self, id: QueueId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("sqlite begin: {}", e)))?;
        tx.execute("DELETE FROM members WHERE queue_id = ?1", params![id])
            .map_err(|e| Error::Storage(format!("sqlite delete members: {}", e)))?;
        let deleted = tx
            .execute("DELETE FROM queues WHERE queue_id = ?1", params![id])
            .map_err(|e| Error::Storage(format!("sqlite delete queue: {}", e)))?;
        tx.commit()
            .map_err(|e| Error::Storage(format!("sqlite commit delete: {}", e)))?;
        Ok(deleted > 0)
    }
}
