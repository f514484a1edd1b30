//! IPC types shared between sandboxed agents and the nanoclawd host.
//!
//! Agents write JSON files into `/workspace/ipc/{channel}/` directories.
//! The host daemon polls these directories, processes files, and (for
//! queries) writes response files that agents poll for.
//!
//! Three IPC channels:
//! - **messages**: outbound messages from an agent (agent → host → channel)
//! - **tasks**: fire-and-forget task management commands (schedule, pause,
//!   resume, cancel, register_group, refresh_groups)
//! - **queries**: UUID request/response reads (get_task, list_tasks)

use serde::{Deserialize, Serialize};

/// Outbound message from a sandboxed agent to a messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Must be "message".
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Target chat JID (e.g., "tg:1108701034").
    #[serde(rename = "chatJid")]
    pub chat_jid: String,
    /// Message text content.
    pub text: String,
    /// Optional sender identity override.
    pub sender: Option<String>,
    /// Source group folder (set by the agent).
    #[serde(rename = "groupFolder")]
    pub group_folder: Option<String>,
    pub timestamp: Option<String>,
}

/// Task management command from a sandboxed agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcTask {
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default = "default_context_mode")]
        context_mode: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        #[serde(rename = "createdBy")]
        created_by: Option<String>,
        timestamp: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    RefreshGroups {
        timestamp: Option<String>,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        trigger: String,
        timestamp: Option<String>,
    },
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

/// A read-only query from a sandboxed agent, answered via a response file.
///
/// The agent writes `{uuid}.json` to `queries/`; the host writes the
/// answer to `responses/{uuid}.json` and removes the request file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcQuery {
    /// Unique request ID — used as the response filename.
    pub uuid: String,
    /// Query type: "get_task" or "list_tasks".
    #[serde(rename = "type")]
    pub query_type: String,
    /// Type-specific parameters, e.g. `{"taskId": "..."}` or `{"groupFolder": "..."}`.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Response to an IPC query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcQueryResponse {
    pub status: String,
    pub result: String,
}

impl IpcQueryResponse {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            result: result.into(),
        }
    }

    pub fn error(result: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            result: result.into(),
        }
    }
}

/// Context for authorization decisions — derived from the IPC directory path.
#[derive(Debug, Clone)]
pub struct IpcGroupContext {
    /// Group folder name (e.g., "main", "team-eng").
    pub group_folder: String,
    /// Whether this is the main group (has elevated privileges).
    pub is_main: bool,
}

impl IpcGroupContext {
    pub fn new(group_folder: impl Into<String>, main_group_name: &str) -> Self {
        let group_folder = group_folder.into();
        let is_main = group_folder == main_group_name;
        Self { group_folder, is_main }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_task_parses_group_folder() {
        let json = r#"{
            "type": "schedule_task",
            "prompt": "check builds",
            "schedule_type": "cron",
            "schedule_value": "0 9 * * *",
            "groupFolder": "main"
        }"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::ScheduleTask { group_folder, context_mode, .. } => {
                assert_eq!(group_folder.as_deref(), Some("main"));
                assert_eq!(context_mode, "isolated");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn query_response_helpers() {
        assert_eq!(IpcQueryResponse::ok("x").status, "ok");
        assert_eq!(IpcQueryResponse::error("y").status, "error");
    }

    #[test]
    fn group_context_detects_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);
        let ctx2 = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx2.is_main);
    }
}
