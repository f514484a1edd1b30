//! Durable state (C1): chats, messages, sessions, registered groups, tasks,
//! task run logs, router cursors, and operator settings.
//!
//! Backed by an embedded single-file SQLite database via `rusqlite`
//! (bundled, so no system SQLite install is required). Schema is applied
//! idempotently at startup; additive column upgrades are attempted and a
//! "duplicate column" failure is treated as already-applied, matching the
//! teacher's "failures mean already present" migration philosophy.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A new inbound message to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    pub is_from_me: bool,
    pub is_bot_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub jid: String,
    pub name: String,
    pub last_message_time: String,
    pub channel: String,
    pub is_group: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    pub is_bot_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    #[serde(default = "default_context_mode")]
    pub context_mode: String,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    #[serde(default = "default_task_status")]
    pub status: String,
    pub created_at: String,
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

fn default_task_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: i64,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: String,
    pub added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_trigger: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Partial update for a scheduled task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub prompt: Option<String>,
    pub schedule_type: Option<String>,
    pub schedule_value: Option<String>,
    pub context_mode: Option<String>,
    pub status: Option<String>,
}

/// Handle to the embedded store. Cheap to clone; the underlying connection
/// is shared behind a mutex since `rusqlite::Connection` is not `Sync`.
#[derive(Clone)]
pub struct Store {
    conn: std::sync::Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if absent) the database file at `path` and apply schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: std::sync::Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: std::sync::Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chats (
                jid TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                last_message_time TEXT NOT NULL DEFAULT '',
                channel TEXT NOT NULL DEFAULT '',
                is_group INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                chat_jid TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_name TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL,
                is_from_me INTEGER NOT NULL DEFAULT 0,
                is_bot_message INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (id, chat_jid)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_jid, timestamp);

            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                group_folder TEXT NOT NULL,
                chat_jid TEXT NOT NULL,
                prompt TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                context_mode TEXT NOT NULL DEFAULT 'isolated',
                next_run TEXT,
                last_run TEXT,
                last_result TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status_next ON scheduled_tasks(status, next_run);

            CREATE TABLE IF NOT EXISTS task_run_logs (
                task_id TEXT NOT NULL REFERENCES scheduled_tasks(id) ON DELETE CASCADE,
                run_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS router_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                group_folder TEXT PRIMARY KEY,
                session_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS registered_groups (
                folder TEXT PRIMARY KEY,
                jid TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                trigger_regex TEXT NOT NULL DEFAULT '',
                added_at TEXT NOT NULL,
                container_config TEXT,
                requires_trigger INTEGER,
                runtime TEXT,
                model TEXT
            );
            "#,
        )?;
        Ok(())
    }

    // -- chats ---------------------------------------------------------

    pub fn upsert_chat(&self, chat: &ChatInfo) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chats (jid, name, last_message_time, channel, is_group)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(jid) DO UPDATE SET
               name = excluded.name,
               last_message_time = excluded.last_message_time,
               channel = excluded.channel,
               is_group = excluded.is_group",
            params![
                chat.jid,
                chat.name,
                chat.last_message_time,
                chat.channel,
                chat.is_group as i64
            ],
        )?;
        Ok(())
    }

    // -- messages --------------------------------------------------------

    pub fn store_message(&self, msg: &NewMessage) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id, chat_jid) DO NOTHING",
            params![
                msg.id,
                msg.chat_jid,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp,
                msg.is_from_me as i64,
                msg.is_bot_message as i64,
            ],
        )?;
        Ok(())
    }

    /// `GetNewMessages(jids, sinceTs, selfName) -> (msgs, newMaxTs)` (§4.1).
    pub fn get_new_messages(
        &self,
        jids: &[String],
        since_ts: &str,
        self_name: &str,
    ) -> StoreResult<(Vec<(String, ConversationMessage)>, String)> {
        if jids.is_empty() {
            return Ok((Vec::new(), since_ts.to_string()));
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = jids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT chat_jid, sender_name, content, timestamp, is_bot_message
             FROM messages
             WHERE timestamp > ?
               AND sender_name != ?
               AND is_bot_message = 0
               AND content != ''
               AND chat_jid IN ({placeholders})
             ORDER BY timestamp ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bind_params: Vec<&dyn rusqlite::ToSql> = vec![&since_ts, &self_name];
        for j in jids {
            bind_params.push(j);
        }
        let rows = stmt.query_map(bind_params.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                ConversationMessage {
                    sender_name: row.get(1)?,
                    content: row.get(2)?,
                    timestamp: row.get(3)?,
                    is_bot_message: row.get::<_, i64>(4)? != 0,
                },
            ))
        })?;
        let mut out = Vec::new();
        let mut max_ts = since_ts.to_string();
        for row in rows {
            let (jid, msg) = row?;
            if msg.timestamp > max_ts {
                max_ts = msg.timestamp.clone();
            }
            out.push((jid, msg));
        }
        Ok((out, max_ts))
    }

    /// `GetMessagesSince(chatId, sinceTs, selfName)` (§4.1) — catch-up window.
    pub fn get_messages_since(
        &self,
        chat_jid: &str,
        since_ts: &str,
        self_name: &str,
    ) -> StoreResult<Vec<ConversationMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sender_name, content, timestamp, is_bot_message
             FROM messages
             WHERE chat_jid = ?1 AND timestamp > ?2 AND sender_name != ?3
               AND content != '' AND content IS NOT NULL
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![chat_jid, since_ts, self_name], |row| {
            Ok(ConversationMessage {
                sender_name: row.get(0)?,
                content: row.get(1)?,
                timestamp: row.get(2)?,
                is_bot_message: row.get::<_, i64>(3)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -- router cursors ----------------------------------------------------

    pub fn get_router_state(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row("SELECT value FROM router_state WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    pub fn set_router_state(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO router_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // -- operator settings (runtime selector, §4.4) -------------------------

    pub fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // -- sessions -----------------------------------------------------------

    pub fn get_session(&self, group_folder: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT session_id FROM sessions WHERE group_folder = ?1",
                [group_folder],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn set_session(&self, group_folder: &str, session_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
             ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id",
            params![group_folder, session_id],
        )?;
        Ok(())
    }

    pub fn all_sessions(&self) -> StoreResult<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT group_folder, session_id FROM sessions")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -- registered groups ----------------------------------------------------

    pub fn upsert_registered_group(&self, group: &RegisteredGroup) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let config_json = group
            .container_config
            .as_ref()
            .map(|v| v.to_string());
        conn.execute(
            "INSERT INTO registered_groups
                (folder, jid, name, trigger_regex, added_at, container_config, requires_trigger, runtime, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(folder) DO UPDATE SET
                jid = excluded.jid,
                name = excluded.name,
                trigger_regex = excluded.trigger_regex,
                container_config = excluded.container_config,
                requires_trigger = excluded.requires_trigger,
                runtime = excluded.runtime,
                model = excluded.model",
            params![
                group.folder,
                group.jid,
                group.name,
                group.trigger,
                group.added_at,
                config_json,
                group.requires_trigger.map(|b| b as i64),
                group.runtime,
                group.model,
            ],
        )?;
        Ok(())
    }

    pub fn all_registered_groups(&self) -> StoreResult<Vec<RegisteredGroup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT folder, jid, name, trigger_regex, added_at, container_config, requires_trigger, runtime, model
             FROM registered_groups",
        )?;
        let rows = stmt.query_map([], row_to_registered_group)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -- scheduled tasks ------------------------------------------------------

    pub fn create_task(&self, task: &ScheduledTask) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_tasks
                (id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode,
                 next_run, last_run, last_result, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type,
                task.schedule_value,
                task.context_mode,
                task.next_run,
                task.last_run,
                task.last_result,
                task.status,
                task.created_at,
            ],
        )
        .map_err(|e| match &e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(task.id.clone())
            }
            _ => StoreError::Backend(e),
        })?;
        Ok(())
    }

    pub fn get_task_by_id(&self, id: &str) -> StoreResult<Option<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode,
                    next_run, last_run, last_result, status, created_at
             FROM scheduled_tasks WHERE id = ?1",
            [id],
            row_to_task,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_tasks_for_folder(&self, group_folder: &str) -> StoreResult<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode,
                    next_run, last_run, last_result, status, created_at
             FROM scheduled_tasks WHERE group_folder = ?1",
        )?;
        let rows = stmt.query_map([group_folder], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn all_tasks(&self) -> StoreResult<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode,
                    next_run, last_run, last_result, status, created_at
             FROM scheduled_tasks",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// `DueTasks(now)` (§4.1): `status='active' AND next_run <= now`.
    pub fn due_tasks(&self, now_iso: &str) -> StoreResult<Vec<ScheduledTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode,
                    next_run, last_run, last_result, status, created_at
             FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1",
        )?;
        let rows = stmt.query_map([now_iso], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_task(&self, id: &str, patch: &TaskUpdate) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let mut sets = Vec::new();
        let mut values: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(ref v) = patch.prompt {
            sets.push("prompt = ?");
            values.push(v);
        }
        if let Some(ref v) = patch.schedule_type {
            sets.push("schedule_type = ?");
            values.push(v);
        }
        if let Some(ref v) = patch.schedule_value {
            sets.push("schedule_value = ?");
            values.push(v);
        }
        if let Some(ref v) = patch.context_mode {
            sets.push("context_mode = ?");
            values.push(v);
        }
        if let Some(ref v) = patch.status {
            sets.push("status = ?");
            values.push(v);
        }
        if sets.is_empty() {
            return Ok(false);
        }
        let sql = format!("UPDATE scheduled_tasks SET {} WHERE id = ?", sets.join(", "));
        values.push(&id);
        let n = conn.execute(&sql, values.as_slice())?;
        Ok(n > 0)
    }

    pub fn delete_task(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Applied after a run completes: bumps `next_run`/`last_run`/`last_result`
    /// and sets `status` (§4.9) — the caller decides `active`/`completed`/`paused`
    /// based on whether the schedule produced a next run, finished (`once`), or
    /// failed to parse.
    pub fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        status: &str,
        summary: &str,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = conn
            .query_row("SELECT datetime('now')", [], |r| r.get::<_, String>(0))
            .unwrap_or_default();
        conn.execute(
            "UPDATE scheduled_tasks
             SET next_run = ?1, last_run = ?2, last_result = ?3, status = ?4
             WHERE id = ?5",
            params![next_run, now, summary, status, id],
        )?;
        Ok(())
    }

    pub fn log_task_run(&self, log: &TaskRunLog) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![log.task_id, log.run_at, log.duration_ms, log.status, log.result, log.error],
        )?;
        Ok(())
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        chat_jid: row.get(2)?,
        prompt: row.get(3)?,
        schedule_type: row.get(4)?,
        schedule_value: row.get(5)?,
        context_mode: row.get(6)?,
        next_run: row.get(7)?,
        last_run: row.get(8)?,
        last_result: row.get(9)?,
        status: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn row_to_registered_group(row: &rusqlite::Row) -> rusqlite::Result<RegisteredGroup> {
    let config_json: Option<String> = row.get(5)?;
    Ok(RegisteredGroup {
        folder: row.get(0)?,
        jid: row.get(1)?,
        name: row.get(2)?,
        trigger: row.get(3)?,
        added_at: row.get(4)?,
        container_config: config_json.and_then(|s| serde_json::from_str(&s).ok()),
        requires_trigger: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
        runtime: row.get(7)?,
        model: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str, folder: &str, next_run: Option<&str>) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: folder.to_string(),
            chat_jid: "tg:1".to_string(),
            prompt: "do the thing".to_string(),
            schedule_type: "once".to_string(),
            schedule_value: "2024-01-01T00:00:00Z".to_string(),
            context_mode: "isolated".to_string(),
            next_run: next_run.map(|s| s.to_string()),
            last_run: None,
            last_result: None,
            status: "active".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn open_in_memory_applies_schema_idempotently() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
    }

    #[test]
    fn message_round_trip_and_new_messages_filter() {
        let store = Store::open_in_memory().unwrap();
        store
            .store_message(&NewMessage {
                id: "m1".into(),
                chat_jid: "tg:1".into(),
                sender: "alice".into(),
                sender_name: "Alice".into(),
                content: "hi".into(),
                timestamp: "2024-01-01T00:00:01Z".into(),
                is_from_me: false,
                is_bot_message: false,
            })
            .unwrap();

        let (msgs, max_ts) = store
            .get_new_messages(&["tg:1".to_string()], "2024-01-01T00:00:00Z", "Bot")
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(max_ts, "2024-01-01T00:00:01Z");

        let (msgs2, _) = store
            .get_new_messages(&["tg:1".to_string()], "2024-01-01T00:00:01Z", "Bot")
            .unwrap();
        assert!(msgs2.is_empty());
    }

    #[test]
    fn get_messages_since_excludes_self() {
        let store = Store::open_in_memory().unwrap();
        store
            .store_message(&NewMessage {
                id: "m1".into(),
                chat_jid: "tg:1".into(),
                sender: "bot".into(),
                sender_name: "Bot".into(),
                content: "reply".into(),
                timestamp: "2024-01-01T00:00:01Z".into(),
                is_from_me: true,
                is_bot_message: true,
            })
            .unwrap();
        let msgs = store.get_messages_since("tg:1", "2024-01-01T00:00:00Z", "Bot").unwrap();
        assert!(msgs.is_empty(), "bot messages must not reappear as context");
    }

    #[test]
    fn due_tasks_respects_status_and_next_run() {
        let store = Store::open_in_memory().unwrap();
        store.create_task(&sample_task("t1", "main", Some("2024-01-01T00:00:00Z"))).unwrap();
        store.create_task(&sample_task("t2", "main", None)).unwrap();

        let due = store.due_tasks("2024-06-01T00:00:00Z").unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "t1");
    }

    #[test]
    fn create_task_duplicate_id_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.create_task(&sample_task("dup", "main", None)).unwrap();
        let err = store.create_task(&sample_task("dup", "main", None)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn update_task_after_run_completes_once_tasks() {
        let store = Store::open_in_memory().unwrap();
        store.create_task(&sample_task("once1", "main", Some("2024-01-01T00:00:00Z"))).unwrap();
        store.update_task_after_run("once1", None, "completed", "Completed").unwrap();
        let task = store.get_task_by_id("once1").unwrap().unwrap();
        assert_eq!(task.status, "completed");
        assert!(task.next_run.is_none());
    }

    #[test]
    fn update_task_after_run_pauses_on_schedule_error() {
        let store = Store::open_in_memory().unwrap();
        store.create_task(&sample_task("cron1", "main", Some("2024-01-01T00:00:00Z"))).unwrap();
        store
            .update_task_after_run("cron1", None, "paused", "invalid cron expression 'bogus'")
            .unwrap();
        let task = store.get_task_by_id("cron1").unwrap().unwrap();
        assert_eq!(task.status, "paused");
        assert_eq!(task.last_result.as_deref(), Some("invalid cron expression 'bogus'"));
    }

    #[test]
    fn update_task_after_run_keeps_active_for_recurring() {
        let store = Store::open_in_memory().unwrap();
        store.create_task(&sample_task("rec1", "main", Some("2024-01-01T00:00:00Z"))).unwrap();
        store
            .update_task_after_run("rec1", Some("2024-02-05T09:00:00Z"), "active", "Completed")
            .unwrap();
        let task = store.get_task_by_id("rec1").unwrap().unwrap();
        assert_eq!(task.status, "active");
        assert_eq!(task.next_run.as_deref(), Some("2024-02-05T09:00:00Z"));
    }

    #[test]
    fn sessions_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_session("main").unwrap().is_none());
        store.set_session("main", "sess-1").unwrap();
        assert_eq!(store.get_session("main").unwrap().as_deref(), Some("sess-1"));
    }

    #[test]
    fn registered_groups_round_trip_with_optional_fields() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_registered_group(&RegisteredGroup {
                jid: "tg:1".into(),
                name: "Main".into(),
                folder: "main".into(),
                trigger: String::new(),
                added_at: "2024-01-01T00:00:00Z".into(),
                container_config: None,
                requires_trigger: Some(false),
                runtime: Some("claude".into()),
                model: None,
            })
            .unwrap();
        let groups = store.all_registered_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].requires_trigger, Some(false));
    }

    #[test]
    fn router_state_and_settings_are_distinct_tables() {
        let store = Store::open_in_memory().unwrap();
        store.set_router_state("last_timestamp", "2024-01-01T00:00:00Z").unwrap();
        store.set_setting("container_runtime", "container").unwrap();
        assert_eq!(
            store.get_router_state("last_timestamp").unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert!(store.get_router_state("container_runtime").unwrap().is_none());
        assert_eq!(store.get_setting("container_runtime").unwrap().as_deref(), Some("container"));
    }
}
