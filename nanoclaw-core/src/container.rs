//! Sandbox agent wire protocol.
//!
//! Defines the contract every sandbox engine honors (§4.3 of the spec):
//! - `ContainerInput`: JSON written to the agent's stdin.
//! - `ContainerOutput`: JSON extracted from stdout between the frame markers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeKind;

/// Sentinel markers bracketing each stdout frame.
pub const OUTPUT_START_MARKER: &str = "---NANOCLAW_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---NANOCLAW_OUTPUT_END---";

/// Input payload written to the agent's stdin as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Secrets injected via stdin, never written to disk.
    /// Zeroed from memory after writing to the child process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
}

/// One decoded frame from the agent's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: ContainerStatus,
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Success,
    Error,
}

/// Bind-mount specification for sandbox engines that support them.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
    /// Subdirectory names to hide via a tmpfs overlay.
    pub exclude: Vec<String>,
}

/// Container image names keyed by agent runtime.
pub fn container_image(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "nanoclaw-agent:latest",
        RuntimeKind::Codex => "nanoclaw-agent-codex:latest",
        RuntimeKind::Opencode => "nanoclaw-agent-opencode:latest",
    }
}

/// Runner source directory name for each runtime.
pub fn runner_dir_name(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "agent-runner",
        RuntimeKind::Codex => "codex-runner",
        RuntimeKind::Opencode => "opencode-runner",
    }
}

/// Mount path for the runner source code inside the sandbox.
/// Claude uses a flat layout at `/app/src`; others nest under their name.
pub fn runner_container_path(runtime: RuntimeKind) -> String {
    match runtime {
        RuntimeKind::Claude => "/app/src".to_string(),
        _ => format!("/app/{}/src", runner_dir_name(runtime)),
    }
}

/// Parses START/END marker pairs out of a byte buffer.
///
/// Returns the extracted JSON strings in order and the number of bytes
/// consumed; an incomplete trailing pair is left for the caller to retain
/// in its buffer and retry once more output arrives.
pub fn extract_output_markers(buf: &str) -> (Vec<String>, usize) {
    let mut results = Vec::new();
    let mut consumed = 0;

    let mut search_from = 0;
    loop {
        let start = match buf[search_from..].find(OUTPUT_START_MARKER) {
            Some(pos) => search_from + pos,
            None => break,
        };

        let after_start = start + OUTPUT_START_MARKER.len();
        let end = match buf[after_start..].find(OUTPUT_END_MARKER) {
            Some(pos) => after_start + pos,
            None => break,
        };

        let json_str = buf[after_start..end].trim().to_string();
        results.push(json_str);

        consumed = end + OUTPUT_END_MARKER.len();
        search_from = consumed;
    }

    (results, consumed)
}

/// Strips `<internal>...</internal>` spans from agent result text before
/// it is surfaced to the channel (§4.5).
pub fn strip_internal_blocks(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<internal>") {
        result.push_str(&rest[..start]);
        match rest[start..].find("</internal>") {
            Some(end) => rest = &rest[start + end + "</internal>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}
