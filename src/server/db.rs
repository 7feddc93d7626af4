use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use commsync_common::{FileMeta, Message, MessageKind, ParticipantId, RoomId, Sender};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use super::models::Project;

/// Async-safe handle to the room database.
///
/// Wraps `RoomDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RoomDb>>,
}

impl DbHandle {
    pub fn new(db: RoomDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RoomDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Returned by [`RoomDb::create_project`] when the name is taken.
#[derive(Debug, thiserror::Error)]
#[error("Project name '{0}' is already taken")]
pub struct DuplicateProjectName(pub String);

pub struct RoomDb {
    conn: Connection,
}

impl RoomDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                );

                CREATE TABLE IF NOT EXISTS project_members (
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    added_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                    PRIMARY KEY (project_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    body TEXT NOT NULL,
                    sender_id TEXT NOT NULL,
                    sender_label TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'user-text',
                    file TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_members_user ON project_members(user_id);
                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations; only "duplicate column" is ignored.
        match self.conn.execute(
            "ALTER TABLE projects ADD COLUMN file_tree TEXT NOT NULL DEFAULT '{}'",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add file_tree column: {}", e)),
        }
        Ok(())
    }

    // ── Projects & membership ─────────────────────────────────────────

    /// Create a project with `creator` as its first member. Names are stored
    /// trimmed and lowercased; a taken name yields [`DuplicateProjectName`].
    pub fn create_project(&self, name: &str, creator: &ParticipantId) -> Result<Project> {
        let name = name.trim().to_lowercase();
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        match tx.execute("INSERT INTO projects (name) VALUES (?1)", params![name]) {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(DuplicateProjectName(name).into());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to insert project")),
        }
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO project_members (project_id, user_id) VALUES (?1, ?2)",
            params![id, creator.as_str()],
        )
        .context("Failed to insert project creator")?;
        tx.commit().context("Failed to commit project")?;
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, file_tree, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query project")?;
        match row {
            Some((id, name, file_tree, created_at)) => Ok(Some(Project {
                id,
                name,
                users: self.list_members(id)?,
                file_tree: serde_json::from_str(&file_tree)
                    .with_context(|| format!("Project {} has a corrupt file tree", id))?,
                created_at,
            })),
            None => Ok(None),
        }
    }

    /// Replace a project's file tree snapshot. `None` if the project is gone.
    pub fn update_file_tree(&self, id: i64, file_tree: &serde_json::Value) -> Result<Option<Project>> {
        let json = serde_json::to_string(file_tree).context("Failed to serialize file tree")?;
        let updated = self
            .conn
            .execute(
                "UPDATE projects SET file_tree = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to update file tree")?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_project(id)
    }

    pub fn project_exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM projects WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("Failed to check project existence")?;
        Ok(found.is_some())
    }

    pub fn list_projects_for_user(&self, user: &ParticipantId) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.id FROM projects p
                 JOIN project_members m ON m.project_id = p.id
                 WHERE m.user_id = ?1 ORDER BY p.id",
            )
            .context("Failed to prepare list_projects_for_user")?;
        let ids = stmt
            .query_map(params![user.as_str()], |row| row.get::<_, i64>(0))
            .context("Failed to query projects")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read project row")?;
        let mut projects = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(project) = self.get_project(id)? {
                projects.push(project);
            }
        }
        Ok(projects)
    }

    pub fn list_members(&self, project_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM project_members WHERE project_id = ?1 ORDER BY added_at, user_id")
            .context("Failed to prepare list_members")?;
        let members = stmt
            .query_map(params![project_id], |row| row.get::<_, String>(0))
            .context("Failed to query members")?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("Failed to read member row")?;
        Ok(members)
    }

    /// Add users to a project. Already-present users are ignored.
    pub fn add_members(&self, project_id: i64, users: &[ParticipantId]) -> Result<Project> {
        for user in users {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO project_members (project_id, user_id) VALUES (?1, ?2)",
                    params![project_id, user.as_str()],
                )
                .context("Failed to insert project member")?;
        }
        self.get_project(project_id)?
            .context("Project not found after adding members")
    }

    pub fn is_member(&self, project_id: i64, user: &ParticipantId) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check membership")?;
        Ok(found.is_some())
    }

    // ── Messages ──────────────────────────────────────────────────────

    /// Append a message to a room's log and return its assigned id.
    pub fn insert_message(&self, room: RoomId, message: &Message) -> Result<i64> {
        let file = message
            .file
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize file metadata")?;
        self.conn
            .execute(
                "INSERT INTO messages (project_id, body, sender_id, sender_label, kind, file, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    room.get(),
                    message.body,
                    message.sender.participant_id.as_str(),
                    message.sender.display_label,
                    message.kind.as_str(),
                    file,
                    message.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                ],
            )
            .context("Failed to insert message")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Timestamp of the most recently inserted message in `room`.
    pub fn last_message_timestamp(&self, room: RoomId) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM messages WHERE project_id = ?1 ORDER BY id DESC LIMIT 1",
                params![room.get()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query last message")?;
        raw.map(|ts| {
            DateTime::parse_from_rfc3339(&ts)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Invalid stored timestamp '{}'", ts))
        })
        .transpose()
    }

    /// All messages in a room, in insertion order.
    pub fn list_messages(&self, room: RoomId) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, body, sender_id, sender_label, kind, file, created_at
                 FROM messages WHERE project_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![room.get()], |row| {
                Ok(MessageRow {
                    id: row.get(0)?,
                    body: row.get(1)?,
                    sender_id: row.get(2)?,
                    sender_label: row.get(3)?,
                    kind: row.get(4)?,
                    file: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?.into_message()?);
        }
        Ok(messages)
    }
}

struct MessageRow {
    id: i64,
    body: String,
    sender_id: String,
    sender_label: String,
    kind: String,
    file: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let participant_id = ParticipantId::try_from(self.sender_id)
            .with_context(|| format!("Message {} has an invalid sender", self.id))?;
        let kind = MessageKind::from_str(&self.kind).map_err(|e| anyhow::anyhow!(e))?;
        let file = self
            .file
            .as_deref()
            .map(serde_json::from_str::<FileMeta>)
            .transpose()
            .with_context(|| format!("Message {} has corrupt file metadata", self.id))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.created_at)
            .with_context(|| format!("Message {} has an invalid timestamp", self.id))?
            .with_timezone(&Utc);
        Ok(Message {
            id: Some(self.id),
            body: self.body,
            sender: Sender::new(participant_id, self.sender_label),
            timestamp,
            kind,
            file,
        })
    }
}
