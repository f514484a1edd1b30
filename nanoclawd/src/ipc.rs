//! Filesystem-based IPC watcher.
//!
//! Polls `{ipc_base}/{group}/` directories for messages, tasks, and queries
//! written by sandboxed agents. Files are processed atomically (read → act →
//! unlink), moving failures to an `errors/` directory for debugging.
//!
//! Authorization model:
//! - Main group can send messages to any chat and manage any task.
//! - Non-main groups can only send to their own registered chat JID and only
//!   manage tasks that belong to their own folder.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nanoclaw_core::{
    IpcGroupContext, IpcMessage, IpcQuery, IpcQueryResponse, IpcTask, RegisteredGroup,
    ScheduledTask, Store, TaskUpdate,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::channel::SharedChannel;

const MAIN_GROUP_FOLDER: &str = "main";

/// Configuration for the IPC watcher.
#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    /// Base directory for IPC files (e.g., `data/ipc`).
    pub ipc_base_dir: PathBuf,
    /// Poll interval.
    pub poll_interval: Duration,
}

impl Default for IpcWatcherConfig {
    fn default() -> Self {
        Self {
            ipc_base_dir: PathBuf::from("data/ipc"),
            poll_interval: Duration::from_secs(1),
        }
    }
}

type GroupsByJid = Arc<RwLock<HashMap<String, RegisteredGroup>>>;

/// The IPC watcher. Owns polling state and dispatches directly against the
/// store and the messaging channel — there is no external host to delegate to.
pub struct IpcWatcher {
    config: IpcWatcherConfig,
    store: Store,
    channel: SharedChannel,
    groups: GroupsByJid,
}

impl IpcWatcher {
    pub fn new(
        config: IpcWatcherConfig,
        store: Store,
        channel: SharedChannel,
        groups: GroupsByJid,
    ) -> Self {
        Self {
            config,
            store,
            channel,
            groups,
        }
    }

    /// Run the IPC polling loop. Call from a tokio::spawn.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        fs::create_dir_all(&self.config.ipc_base_dir).ok();
        info!(dir = %self.config.ipc_base_dir.display(), "IPC watcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Process one polling cycle across all group directories.
    async fn poll_once(&self) {
        let group_folders = match fs::read_dir(&self.config.ipc_base_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| {
                    entry.file_type().is_ok_and(|ft| ft.is_dir())
                        && entry.file_name() != "errors"
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!(err = %err, "IPC base directory not readable");
                return;
            }
        };

        for group_folder in group_folders {
            let ctx = IpcGroupContext::new(&group_folder, MAIN_GROUP_FOLDER);
            let group_dir = self.config.ipc_base_dir.join(&group_folder);

            self.process_messages(&group_dir, &ctx).await;
            self.process_tasks(&group_dir, &ctx).await;
            self.process_queries(&group_dir, &ctx);
        }
    }

    /// Find the registered group owning a given folder, if any.
    async fn group_for_folder(&self, group_folder: &str) -> Option<RegisteredGroup> {
        let groups = self.groups.read().await;
        groups.values().find(|g| g.folder == group_folder).cloned()
    }

    /// Process outbound messages from `{group}/messages/`.
    async fn process_messages(&self, group_dir: &Path, ctx: &IpcGroupContext) {
        let messages_dir = group_dir.join("messages");
        let files = match read_json_files(&messages_dir) {
            Some(files) => files,
            None => return,
        };

        for file_path in files {
            match read_and_parse::<IpcMessage>(&file_path) {
                Ok(msg) => {
                    if msg.msg_type != "message" || msg.chat_jid.is_empty() || msg.text.is_empty() {
                        warn!(path = %file_path.display(), "Invalid IPC message — missing fields");
                        move_to_errors(
                            &self.config.ipc_base_dir,
                            &file_path,
                            &ctx.group_folder,
                            "invalid message — missing type, chatJid, or text",
                        );
                        continue;
                    }

                    let authorized =
                        ctx.is_main || self.is_authorized_target(&msg.chat_jid, &ctx.group_folder).await;

                    if authorized {
                        if let Err(err) = self.channel.send_message(&msg.chat_jid, &msg.text).await {
                            error!(
                                chat_jid = %msg.chat_jid,
                                err = %err,
                                "failed to dispatch IPC message via channel"
                            );
                        } else {
                            debug!(
                                chat_jid = %msg.chat_jid,
                                group = %ctx.group_folder,
                                "IPC message dispatched"
                            );
                        }
                        remove_file(&file_path);
                    } else {
                        warn!(
                            chat_jid = %msg.chat_jid,
                            group = %ctx.group_folder,
                            "Unauthorized IPC message attempt blocked"
                        );
                        move_to_errors(
                            &self.config.ipc_base_dir,
                            &file_path,
                            &ctx.group_folder,
                            &format!(
                                "unauthorized — group '{}' may not send to chat_jid '{}'",
                                ctx.group_folder, msg.chat_jid
                            ),
                        );
                    }
                }
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "Failed to parse IPC message");
                    move_to_errors(
                        &self.config.ipc_base_dir,
                        &file_path,
                        &ctx.group_folder,
                        &err.to_string(),
                    );
                }
            }
        }
    }

    /// Process task commands from `{group}/tasks/`.
    async fn process_tasks(&self, group_dir: &Path, ctx: &IpcGroupContext) {
        let tasks_dir = group_dir.join("tasks");
        let files = match read_json_files(&tasks_dir) {
            Some(files) => files,
            None => return,
        };

        for file_path in files {
            match read_and_parse::<IpcTask>(&file_path) {
                Ok(task) => match self.apply_task(task, ctx).await {
                    Ok(()) => remove_file(&file_path),
                    Err(reason) => {
                        move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder, &reason)
                    }
                },
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "Failed to parse IPC task");
                    move_to_errors(
                        &self.config.ipc_base_dir,
                        &file_path,
                        &ctx.group_folder,
                        &err.to_string(),
                    );
                }
            }
        }
    }

    /// Apply a task management command directly against the store.
    ///
    /// Returns `Err(reason)` when the command is rejected (unknown target,
    /// unauthorized) or fails to apply — the caller moves the originating
    /// file to `errors/` with `reason` as the `.err` companion.
    async fn apply_task(&self, task: IpcTask, ctx: &IpcGroupContext) -> Result<(), String> {
        match task {
            IpcTask::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                group_folder,
                created_by,
                ..
            } => {
                let group_folder = group_folder.unwrap_or_else(|| ctx.group_folder.clone());
                let chat_jid = match self.group_for_folder(&group_folder).await {
                    Some(group) => group.jid,
                    None => {
                        warn!(group_folder, "schedule_task for unknown group folder");
                        return Err(format!(
                            "schedule_task rejected — unknown group folder '{group_folder}'"
                        ));
                    }
                };

                if !ctx.is_main {
                    let own_jid = self.group_for_folder(&ctx.group_folder).await.map(|g| g.jid);
                    let authorized =
                        group_folder == ctx.group_folder && own_jid.as_deref() == Some(chat_jid.as_str());
                    if !authorized {
                        warn!(
                            group = %ctx.group_folder,
                            target_folder = %group_folder,
                            "schedule_task rejected — not authorized for target group"
                        );
                        return Err(format!(
                            "schedule_task rejected — group '{}' may not schedule tasks for group '{}'",
                            ctx.group_folder, group_folder
                        ));
                    }
                }

                let task = ScheduledTask {
                    id: format!("task-{}", uuid_like()),
                    group_folder,
                    chat_jid,
                    prompt,
                    schedule_type,
                    schedule_value,
                    context_mode,
                    next_run: None,
                    last_run: None,
                    last_result: None,
                    status: "active".to_string(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                };
                match self.store.create_task(&task) {
                    Ok(()) => {
                        info!(task_id = %task.id, created_by = ?created_by, "task scheduled via IPC");
                        Ok(())
                    }
                    Err(err) => {
                        error!(task_id = %task.id, err = %err, "failed to create scheduled task");
                        Err(format!("failed to create scheduled task: {err}"))
                    }
                }
            }
            IpcTask::PauseTask { task_id, .. } => self.set_task_status(&task_id, "paused", ctx).await,
            IpcTask::ResumeTask { task_id, .. } => self.set_task_status(&task_id, "active", ctx).await,
            IpcTask::CancelTask { task_id, .. } => self.set_task_status(&task_id, "cancelled", ctx).await,
            IpcTask::RefreshGroups { .. } => {
                if !ctx.is_main {
                    warn!(group = %ctx.group_folder, "refresh_groups rejected — only main may refresh groups");
                    return Err(format!(
                        "refresh_groups rejected — only main may refresh groups (requested by '{}')",
                        ctx.group_folder
                    ));
                }
                self.refresh_groups().await;
                Ok(())
            }
            IpcTask::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
                ..
            } => {
                if !ctx.is_main {
                    warn!(group = %ctx.group_folder, "register_group rejected — only main may register groups");
                    return Err(format!(
                        "register_group rejected — only main may register groups (requested by '{}')",
                        ctx.group_folder
                    ));
                }
                let group = RegisteredGroup {
                    jid,
                    name,
                    folder,
                    trigger,
                    added_at: chrono::Utc::now().to_rfc3339(),
                    container_config: None,
                    requires_trigger: None,
                    runtime: None,
                    model: None,
                };
                match self.store.upsert_registered_group(&group) {
                    Ok(()) => {
                        self.refresh_groups().await;
                        Ok(())
                    }
                    Err(err) => {
                        error!(jid = %group.jid, err = %err, "failed to register group via IPC");
                        Err(format!("failed to register group: {err}"))
                    }
                }
            }
        }
    }

    /// Pause/resume/cancel a task, scoped to the owning group unless main.
    async fn set_task_status(
        &self,
        task_id: &str,
        status: &str,
        ctx: &IpcGroupContext,
    ) -> Result<(), String> {
        match self.store.get_task_by_id(task_id) {
            Ok(Some(existing)) => {
                if !ctx.is_main && existing.group_folder != ctx.group_folder {
                    warn!(
                        task_id,
                        group = %ctx.group_folder,
                        "task status change rejected — not owner"
                    );
                    return Err(format!(
                        "task status change rejected — '{}' does not own task '{task_id}'",
                        ctx.group_folder
                    ));
                }
                let patch = TaskUpdate {
                    status: Some(status.to_string()),
                    ..Default::default()
                };
                self.store
                    .update_task(task_id, &patch)
                    .map(|_| ())
                    .map_err(|err| format!("failed to update task status: {err}"))
            }
            Ok(None) => {
                warn!(task_id, "task status change for unknown task");
                Err(format!("task status change for unknown task '{task_id}'"))
            }
            Err(err) => {
                error!(task_id, err = %err, "failed to look up task");
                Err(format!("failed to look up task '{task_id}': {err}"))
            }
        }
    }

    /// Reload the in-memory jid → group map from the store.
    async fn refresh_groups(&self) {
        match self.store.all_registered_groups() {
            Ok(all) => {
                let mut g = self.groups.write().await;
                g.clear();
                for group in all {
                    g.insert(group.jid.clone(), group);
                }
                info!(count = g.len(), "registered groups refreshed from store");
            }
            Err(err) => error!(err = %err, "failed to reload registered groups"),
        }
    }

    /// Process queries from `{group}/queries/`, writing responses to `{group}/responses/{uuid}.json`.
    fn process_queries(&self, group_dir: &Path, ctx: &IpcGroupContext) {
        let queries_dir = group_dir.join("queries");
        let responses_dir = group_dir.join("responses");
        let files = match read_json_files(&queries_dir) {
            Some(files) => files,
            None => return,
        };

        for file_path in files {
            match read_and_parse::<IpcQuery>(&file_path) {
                Ok(query) => {
                    if query.uuid.is_empty() || query.query_type.is_empty() {
                        warn!(
                            path = %file_path.display(),
                            group = %ctx.group_folder,
                            "Invalid query — missing uuid or type"
                        );
                        move_to_errors(
                            &self.config.ipc_base_dir,
                            &file_path,
                            &ctx.group_folder,
                            "invalid query — missing uuid or type",
                        );
                        continue;
                    }

                    let response = self.handle_query(&query, ctx);

                    if let Err(err) = write_response(&responses_dir, &query.uuid, &response) {
                        error!(uuid = %query.uuid, err = %err, "Failed to write query response");
                    }

                    remove_file(&file_path);
                    debug!(
                        query_type = %query.query_type,
                        uuid = %query.uuid,
                        group = %ctx.group_folder,
                        status = %response.status,
                        "IPC query processed"
                    );
                }
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "Failed to parse IPC query");
                    move_to_errors(
                        &self.config.ipc_base_dir,
                        &file_path,
                        &ctx.group_folder,
                        &err.to_string(),
                    );
                }
            }
        }
    }

    /// Answer `get_task` / `list_tasks` queries directly from the store.
    fn handle_query(&self, query: &IpcQuery, ctx: &IpcGroupContext) -> IpcQueryResponse {
        let params = &query.params;

        match query.query_type.as_str() {
            "get_task" => {
                let task_id = match params.get("taskId").and_then(|v| v.as_str()) {
                    Some(id) => id,
                    None => return IpcQueryResponse::error("get_task requires taskId"),
                };
                match self.store.get_task_by_id(task_id) {
                    Ok(Some(task)) => {
                        if !ctx.is_main && task.group_folder != ctx.group_folder {
                            return IpcQueryResponse::error("task not visible to this group");
                        }
                        match serde_json::to_string(&task) {
                            Ok(json) => IpcQueryResponse::ok(json),
                            Err(err) => IpcQueryResponse::error(err.to_string()),
                        }
                    }
                    Ok(None) => IpcQueryResponse::error("task not found"),
                    Err(err) => IpcQueryResponse::error(err.to_string()),
                }
            }
            "list_tasks" => {
                let folder = if ctx.is_main {
                    params
                        .get("groupFolder")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&ctx.group_folder)
                        .to_string()
                } else {
                    ctx.group_folder.clone()
                };
                match self.store.list_tasks_for_folder(&folder) {
                    Ok(tasks) => match serde_json::to_string(&tasks) {
                        Ok(json) => IpcQueryResponse::ok(json),
                        Err(err) => IpcQueryResponse::error(err.to_string()),
                    },
                    Err(err) => IpcQueryResponse::error(err.to_string()),
                }
            }
            unknown => IpcQueryResponse::error(format!("Unknown query type: {unknown}")),
        }
    }

    /// Check if a non-main group is authorized to send to a given chat JID —
    /// true only if the JID is that group's own registered chat.
    async fn is_authorized_target(&self, chat_jid: &str, group_folder: &str) -> bool {
        match self.group_for_folder(group_folder).await {
            Some(group) => group.jid == chat_jid,
            None => false,
        }
    }
}

/// Generate a reasonably unique id without depending on a uuid crate.
fn uuid_like() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}")
}

// ── Filesystem helpers ─────────────────────────────────────────────

/// Read sorted `.json` filenames from a directory. Returns None if dir doesn't exist.
fn read_json_files(dir: &Path) -> Option<Vec<PathBuf>> {
    if !dir.exists() {
        return None;
    }

    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            Some(files)
        }
        Err(err) => {
            error!(dir = %dir.display(), err = %err, "Failed to read IPC directory");
            None
        }
    }
}

/// Read and parse a JSON file.
fn read_and_parse<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = fs::read_to_string(path)?;
    let parsed = serde_json::from_str(&content)?;
    Ok(parsed)
}

/// Write a query response atomically (write .tmp then rename).
fn write_response(
    responses_dir: &Path,
    uuid: &str,
    response: &IpcQueryResponse,
) -> anyhow::Result<()> {
    fs::create_dir_all(responses_dir)?;
    let response_path = responses_dir.join(format!("{uuid}.json"));
    let temp_path = responses_dir.join(format!("{uuid}.json.tmp"));
    let content = serde_json::to_string_pretty(response)?;
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, &response_path)?;
    Ok(())
}

/// Move a failed file to the errors directory for debugging, writing an
/// adjacent `.err` text file with `reason`.
fn move_to_errors(ipc_base: &Path, file_path: &Path, group_folder: &str, reason: &str) {
    let error_dir = ipc_base.join("errors");
    fs::create_dir_all(&error_dir).ok();

    if let Some(filename) = file_path.file_name() {
        let dest = error_dir.join(format!("{group_folder}-{}", filename.to_string_lossy()));
        if let Err(err) = fs::rename(file_path, &dest) {
            error!(
                path = %file_path.display(),
                err = %err,
                "Failed to move error file"
            );
            return;
        }
        let err_path = dest.with_extension("err");
        if let Err(err) = fs::write(&err_path, reason) {
            error!(
                path = %err_path.display(),
                err = %err,
                "Failed to write error companion file"
            );
        }
    }
}

/// Remove a processed file, ignoring errors.
fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), err = %err, "Failed to remove processed IPC file");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::channel::LoggingChannel;

    use super::*;

    fn watcher(ipc_base: PathBuf) -> IpcWatcher {
        let store = Store::open_in_memory().unwrap();
        let channel: SharedChannel = Arc::new(LoggingChannel);
        let groups: GroupsByJid = Arc::new(RwLock::new(HashMap::new()));
        IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base,
                ..Default::default()
            },
            store,
            channel,
            groups,
        )
    }

    #[test]
    fn ipc_group_context_detects_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);

        let ctx = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx.is_main);
    }

    #[test]
    fn atomic_response_write() {
        let tmp = tempfile::tempdir().unwrap();
        let responses_dir = tmp.path().join("responses");
        let response = IpcQueryResponse::ok("hello");

        write_response(&responses_dir, "abc-123", &response).unwrap();

        let written = fs::read_to_string(responses_dir.join("abc-123.json")).unwrap();
        let parsed: IpcQueryResponse = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.status, "ok");
        assert_eq!(parsed.result, "hello");
        assert!(!responses_dir.join("abc-123.json.tmp").exists());
    }

    #[test]
    fn move_to_errors_preserves_file_and_writes_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path();
        let file_path = ipc_base.join("test-query.json");
        fs::write(&file_path, "bad json").unwrap();

        move_to_errors(ipc_base, &file_path, "team-eng", "malformed json");

        assert!(!file_path.exists());
        assert!(ipc_base.join("errors/team-eng-test-query.json").exists());
        let reason = fs::read_to_string(ipc_base.join("errors/team-eng-test-query.err")).unwrap();
        assert_eq!(reason, "malformed json");
    }

    #[test]
    fn read_json_files_returns_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        fs::write(dir.join("003-xyz.json"), "{}").unwrap();
        fs::write(dir.join("001-abc.json"), "{}").unwrap();
        fs::write(dir.join("002-def.json"), "{}").unwrap();
        fs::write(dir.join("readme.txt"), "not json").unwrap();

        let files = read_json_files(dir).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("001-abc.json"));
        assert!(files[1].ends_with("002-def.json"));
        assert!(files[2].ends_with("003-xyz.json"));
    }

    #[test]
    fn read_json_files_nonexistent_dir_returns_none() {
        assert!(read_json_files(Path::new("/nonexistent/path")).is_none());
    }

    #[test]
    fn parse_ipc_query_from_json() {
        let json = r#"{"uuid": "abc-123", "type": "list_tasks", "params": {}}"#;
        let query: IpcQuery = serde_json::from_str(json).unwrap();
        assert_eq!(query.uuid, "abc-123");
        assert_eq!(query.query_type, "list_tasks");
    }

    #[test]
    fn parse_ipc_message_from_json() {
        let json = r#"{
            "type": "message",
            "chatJid": "tg:1108701034",
            "text": "Hello from agent",
            "sender": "Nanoclaw",
            "groupFolder": "main",
            "timestamp": "2026-02-25T12:00:00Z"
        }"#;
        let msg: IpcMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.chat_jid, "tg:1108701034");
        assert_eq!(msg.text, "Hello from agent");
        assert_eq!(msg.sender.as_deref(), Some("Nanoclaw"));
    }

    #[test]
    fn parse_ipc_task_schedule() {
        let json = r#"{
            "type": "schedule_task",
            "prompt": "Check build status",
            "schedule_type": "cron",
            "schedule_value": "0 9 * * *",
            "context_mode": "group",
            "timestamp": "2026-02-25T12:00:00Z"
        }"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                ..
            } => {
                assert_eq!(prompt, "Check build status");
                assert_eq!(schedule_type, "cron");
                assert_eq!(schedule_value, "0 9 * * *");
                assert_eq!(context_mode, "group");
            }
            _ => panic!("Expected ScheduleTask"),
        }
    }

    #[test]
    fn parse_ipc_task_cancel() {
        let json = r#"{"type": "cancel_task", "taskId": "task-12345"}"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::CancelTask { task_id, .. } => {
                assert_eq!(task_id, "task-12345");
            }
            _ => panic!("Expected CancelTask"),
        }
    }

    #[tokio::test]
    async fn poll_once_processes_query_and_writes_response() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let queries_dir = ipc_base.join("main/queries");
        fs::create_dir_all(&queries_dir).unwrap();
        let query = serde_json::json!({
            "uuid": "test-uuid-001",
            "type": "list_tasks",
            "params": {}
        });
        fs::write(
            queries_dir.join("001-query.json"),
            serde_json::to_string(&query).unwrap(),
        )
        .unwrap();

        let w = watcher(ipc_base.clone());
        w.poll_once().await;

        assert!(!queries_dir.join("001-query.json").exists());

        let response_path = ipc_base.join("main/responses/test-uuid-001.json");
        assert!(response_path.exists());

        let response: IpcQueryResponse =
            serde_json::from_str(&fs::read_to_string(&response_path).unwrap()).unwrap();
        assert_eq!(response.status, "ok");
        assert_eq!(response.result, "[]");
    }

    #[tokio::test]
    async fn poll_once_moves_bad_json_to_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let queries_dir = ipc_base.join("main/queries");
        fs::create_dir_all(&queries_dir).unwrap();
        fs::write(queries_dir.join("bad.json"), "not valid json {{{").unwrap();

        let w = watcher(ipc_base.clone());
        w.poll_once().await;

        assert!(!queries_dir.join("bad.json").exists());
        assert!(ipc_base.join("errors/main-bad.json").exists());
    }

    #[tokio::test]
    async fn poll_once_dispatches_message_for_main_group() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let messages_dir = ipc_base.join("main/messages");
        fs::create_dir_all(&messages_dir).unwrap();
        let msg = serde_json::json!({
            "type": "message",
            "chatJid": "tg:99999",
            "text": "Hello from test",
            "timestamp": "2026-02-25T12:00:00Z"
        });
        fs::write(
            messages_dir.join("001-msg.json"),
            serde_json::to_string(&msg).unwrap(),
        )
        .unwrap();

        let w = watcher(ipc_base.clone());
        w.poll_once().await;

        assert!(!messages_dir.join("001-msg.json").exists());
    }

    #[tokio::test]
    async fn poll_once_blocks_unauthorized_message_from_non_main() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let messages_dir = ipc_base.join("team-eng/messages");
        fs::create_dir_all(&messages_dir).unwrap();
        let msg = serde_json::json!({
            "type": "message",
            "chatJid": "tg:99999",
            "text": "Should be blocked",
            "timestamp": "2026-02-25T12:00:00Z"
        });
        fs::write(
            messages_dir.join("001-msg.json"),
            serde_json::to_string(&msg).unwrap(),
        )
        .unwrap();

        // team-eng is not registered, so there's no matching jid — the send
        // is rejected and the file is still consumed.
        let w = watcher(ipc_base.clone());
        w.poll_once().await;

        assert!(!messages_dir.join("001-msg.json").exists());
    }

    #[tokio::test]
    async fn schedule_task_creates_row_for_known_group() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let w = watcher(ipc_base);
        {
            let mut g = w.groups.write().await;
            g.insert(
                "tg:123".to_string(),
                RegisteredGroup {
                    jid: "tg:123".to_string(),
                    name: "Eng".to_string(),
                    folder: "team-eng".to_string(),
                    trigger: String::new(),
                    added_at: String::new(),
                    container_config: None,
                    requires_trigger: None,
                    runtime: None,
                    model: None,
                },
            );
        }

        let ctx = IpcGroupContext::new("team-eng", "main");
        w.apply_task(
            IpcTask::ScheduleTask {
                prompt: "check builds".to_string(),
                schedule_type: "cron".to_string(),
                schedule_value: "0 9 * * *".to_string(),
                context_mode: "isolated".to_string(),
                group_folder: Some("team-eng".to_string()),
                created_by: None,
                timestamp: None,
            },
            &ctx,
        )
        .await;

        let tasks = w.store.list_tasks_for_folder("team-eng").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].chat_jid, "tg:123");
    }

    #[tokio::test]
    async fn schedule_task_for_other_group_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let w = watcher(ipc_base);
        {
            let mut g = w.groups.write().await;
            g.insert(
                "tg:111".to_string(),
                RegisteredGroup {
                    jid: "tg:111".to_string(),
                    name: "W1".to_string(),
                    folder: "W1".to_string(),
                    trigger: String::new(),
                    added_at: String::new(),
                    container_config: None,
                    requires_trigger: None,
                    runtime: None,
                    model: None,
                },
            );
            g.insert(
                "tg:222".to_string(),
                RegisteredGroup {
                    jid: "tg:222".to_string(),
                    name: "W2".to_string(),
                    folder: "W2".to_string(),
                    trigger: String::new(),
                    added_at: String::new(),
                    container_config: None,
                    requires_trigger: None,
                    runtime: None,
                    model: None,
                },
            );
        }

        // W2 is non-main and tries to schedule a task for W1's folder.
        let ctx = IpcGroupContext::new("W2", "main");
        let result = w
            .apply_task(
                IpcTask::ScheduleTask {
                    prompt: "exfiltrate".to_string(),
                    schedule_type: "once".to_string(),
                    schedule_value: "2026-01-01T00:00:00Z".to_string(),
                    context_mode: "isolated".to_string(),
                    group_folder: Some("W1".to_string()),
                    created_by: None,
                    timestamp: None,
                },
                &ctx,
            )
            .await;

        assert!(result.is_err());
        assert!(w.store.list_tasks_for_folder("W1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_groups_from_non_main_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let w = watcher(tmp.path().to_path_buf());
        let ctx = IpcGroupContext::new("team-eng", "main");

        let result = w
            .apply_task(IpcTask::RefreshGroups { timestamp: None }, &ctx)
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn refresh_groups_from_main_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let w = watcher(tmp.path().to_path_buf());
        let ctx = IpcGroupContext::new("main", "main");

        let result = w
            .apply_task(IpcTask::RefreshGroups { timestamp: None }, &ctx)
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn process_tasks_moves_rejected_task_to_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();
        let w = watcher(ipc_base.clone());

        let tasks_dir = ipc_base.join("team-eng/tasks");
        fs::create_dir_all(&tasks_dir).unwrap();
        let task = serde_json::json!({
            "type": "refresh_groups"
        });
        fs::write(
            tasks_dir.join("001-task.json"),
            serde_json::to_string(&task).unwrap(),
        )
        .unwrap();

        w.poll_once().await;

        assert!(!tasks_dir.join("001-task.json").exists());
        assert!(ipc_base.join("errors/team-eng-001-task.json").exists());
        assert!(ipc_base.join("errors/team-eng-001-task.err").exists());
    }
}
