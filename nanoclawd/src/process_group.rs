//! processGroupMessages callback — invoked by GroupQueue when it's a group's turn.
//!
//! Flow:
//! 1. Look up group from JID in shared state
//! 2. Fetch pending messages from the store since lastAgentTimestamp
//! 3. Check trigger for non-main groups
//! 4. Format prompt from messages
//! 5. Spawn container via run_container_agent()
//! 6. Stream output: route results to the messaging channel
//! 7. Store bot responses in the store
//! 8. Advance per-group cursor on success, rollback on error

use std::collections::HashMap;
use std::sync::Arc;

use nanoclaw_core::{
    ContainerInput, ContainerOutput, ContainerStatus, NewMessage, RegisteredGroup, RuntimeKind,
    SandboxConfig, SandboxKind, Store, strip_internal_blocks,
};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::channel::SharedChannel;
use crate::container::mounts::GroupInfo;
use crate::container::runner::{OutputCallback, RunConfig, run_container_agent};
use crate::message_loop;
use crate::queue::{GroupQueue, ProcessMessagesFn};

/// Build the `ProcessMessagesFn` closure that GroupQueue invokes for message processing.
///
/// The returned closure captures all shared state and is `Send + Sync`.
pub fn build_process_messages_fn(
    store: Store,
    queue: Arc<GroupQueue>,
    groups: Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    sessions: Arc<RwLock<HashMap<String, String>>>,
    channel: SharedChannel,
    assistant_name: String,
    main_group_folder: String,
    run_config: RunConfig,
) -> ProcessMessagesFn {
    Arc::new(move |chat_jid: String| {
        let store = store.clone();
        let queue = queue.clone();
        let groups = groups.clone();
        let sessions = sessions.clone();
        let channel = channel.clone();
        let assistant_name = assistant_name.clone();
        let main_group_folder = main_group_folder.clone();
        let run_config = run_config.clone();

        Box::pin(async move {
            match process_group_messages(
                &chat_jid,
                &store,
                &queue,
                &groups,
                &sessions,
                &channel,
                &assistant_name,
                &main_group_folder,
                &run_config,
            )
            .await
            {
                Ok(success) => success,
                Err(e) => {
                    error!(chat_jid, err = %e, "processGroupMessages failed");
                    false
                }
            }
        })
    })
}

/// Core logic for processing messages for a single group.
async fn process_group_messages(
    chat_jid: &str,
    store: &Store,
    queue: &Arc<GroupQueue>,
    groups: &Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    sessions: &Arc<RwLock<HashMap<String, String>>>,
    channel: &SharedChannel,
    assistant_name: &str,
    main_group_folder: &str,
    run_config: &RunConfig,
) -> anyhow::Result<bool> {
    // 1. Look up group
    let group = {
        let g = groups.read().await;
        match g.get(chat_jid) {
            Some(group) => group.clone(),
            None => return Ok(true), // unknown group — skip, not an error
        }
    };

    let is_main = group.folder == main_group_folder;

    // 2. Load agent timestamp and fetch pending messages
    let mut agent_timestamps = message_loop::load_agent_timestamps_pub(store)?;
    let since = agent_timestamps
        .0
        .get(chat_jid)
        .cloned()
        .unwrap_or_default();

    let pending = store.get_messages_since(chat_jid, &since, assistant_name)?;

    if pending.is_empty() {
        return Ok(true);
    }

    // 3. Check trigger for non-main groups
    if !is_main && group.requires_trigger.unwrap_or(true) {
        let trigger = if group.trigger.is_empty() {
            None
        } else {
            Some(group.trigger.as_str())
        };
        let re = message_loop::build_trigger_regex_pub(assistant_name, trigger);
        let has_trigger = pending.iter().any(|m| re.is_match(m.content.trim()));
        if !has_trigger {
            return Ok(true);
        }
    }

    // 4. Format prompt
    let prompt = message_loop::format_messages_pub(&pending);

    // Save cursor position for rollback on error
    let previous_cursor = since.clone();
    let new_cursor = pending
        .last()
        .map(|m| m.timestamp.clone())
        .unwrap_or_default();

    // Advance cursor before running agent (matches original behavior)
    agent_timestamps
        .0
        .insert(chat_jid.to_string(), new_cursor.clone());
    message_loop::save_agent_timestamps_pub(store, &agent_timestamps)?;

    info!(
        group = group.name.as_str(),
        message_count = pending.len(),
        "processing messages"
    );

    // 5. Resolve runtime and session
    let runtime = resolve_runtime(store, &group);
    let session_id = {
        let s = sessions.read().await;
        s.get(&group.folder).cloned()
    };

    let input = ContainerInput {
        prompt,
        session_id,
        group_folder: group.folder.clone(),
        chat_jid: chat_jid.to_string(),
        is_main,
        is_scheduled_task: None,
        assistant_name: Some(assistant_name.to_string()),
        model: group.model.clone(),
        secrets: None, // Secrets injected by runner from env files
    };

    let group_info = GroupInfo {
        folder: group.folder.clone(),
        name: group.name.clone(),
        container_config: group
            .container_config
            .as_ref()
            .and_then(|v| serde_json::from_value::<SandboxConfig>(v.clone()).ok()),
    };

    let sandbox_kind = resolve_sandbox_kind(
        store,
        group_info.container_config.as_ref(),
        run_config.sandbox_kind,
    );
    let sandbox_kind = crate::container::runner::resolve_available_sandbox_kind(sandbox_kind).await;

    // 6. Run container and collect output
    let sessions_clone: Arc<RwLock<HashMap<String, String>>> = sessions.clone();
    let group_folder = group.folder.clone();
    let queue_clone: Arc<GroupQueue> = queue.clone();
    let chat_jid_owned = chat_jid.to_string();

    // Track whether we sent any output to the user
    let output_sent = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let output_sent_cb = output_sent.clone();

    let channel_cb: SharedChannel = channel.clone();
    let store_cb = store.clone();
    let assistant_name_cb = assistant_name.to_string();

    let on_output: Option<Arc<OutputCallback>> = Some(Arc::new(Box::new(
        move |output: ContainerOutput| {
            let sessions = sessions_clone.clone();
            let group_folder = group_folder.clone();
            let queue = queue_clone.clone();
            let chat_jid = chat_jid_owned.clone();
            let channel = channel_cb.clone();
            let store = store_cb.clone();
            let assistant_name = assistant_name_cb.clone();
            let output_sent = output_sent_cb.clone();

            Box::pin(async move {
                // Track session ID from container
                if let Some(ref sid) = output.new_session_id {
                    let mut s = sessions.write().await;
                    s.insert(group_folder.clone(), sid.clone());
                    if let Err(e) = store.set_session(&group_folder, sid) {
                        warn!(err = %e, "failed to persist session");
                    }
                }

                // Handle final result
                if let Some(ref result_text) = output.result {
                    let text = strip_internal_blocks(result_text);
                    if !text.is_empty() {
                        if let Err(e) = channel.send_message(&chat_jid, &text).await {
                            error!(err = %e, "failed to send agent output via channel");
                        }

                        let bot_msg = NewMessage {
                            id: format!("bot-{}", chrono::Utc::now().timestamp_millis()),
                            chat_jid: chat_jid.clone(),
                            sender: "bot".into(),
                            sender_name: assistant_name.clone(),
                            content: text,
                            timestamp: chrono::Utc::now().to_rfc3339(),
                            is_from_me: true,
                            is_bot_message: true,
                        };
                        if let Err(e) = store.store_message(&bot_msg) {
                            warn!(err = %e, "failed to store bot response");
                        }

                        output_sent.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                }

                // Notify queue on completion
                if output.status == ContainerStatus::Success {
                    queue.notify_idle(&chat_jid).await;
                }
            })
        },
    )));

    let result = run_container_agent(
        &group_info,
        &input,
        runtime,
        sandbox_kind,
        is_main,
        run_config,
        on_output,
    )
    .await;

    // 7. Handle result
    match result {
        Ok(run_result) => {
            // Track session from final output
            if let Some(ref sid) = run_result.output.new_session_id {
                let mut s = sessions.write().await;
                s.insert(group.folder.clone(), sid.clone());
                if let Err(e) = store.set_session(&group.folder, sid) {
                    warn!(err = %e, "failed to persist session");
                }
            }

            if run_result.output.status == ContainerStatus::Error {
                // Error, but if we already sent output, don't rollback cursor
                if output_sent.load(std::sync::atomic::Ordering::SeqCst) {
                    warn!(
                        group = group.name.as_str(),
                        "agent error after output sent, skipping cursor rollback"
                    );
                    return Ok(true);
                }

                // Rollback cursor for retry
                agent_timestamps
                    .0
                    .insert(chat_jid.to_string(), previous_cursor);
                message_loop::save_agent_timestamps_pub(store, &agent_timestamps)?;
                warn!(
                    group = group.name.as_str(),
                    "agent error, rolled back cursor for retry"
                );
                return Ok(false);
            }

            Ok(true)
        }
        Err(e) => {
            error!(group = group.name.as_str(), err = %e, "container agent error");

            if output_sent.load(std::sync::atomic::Ordering::SeqCst) {
                warn!(
                    group = group.name.as_str(),
                    "agent error after output sent, skipping cursor rollback"
                );
                return Ok(true);
            }

            // Rollback cursor
            agent_timestamps
                .0
                .insert(chat_jid.to_string(), previous_cursor);
            message_loop::save_agent_timestamps_pub(store, &agent_timestamps)?;
            Ok(false)
        }
    }
}

/// Environment variable consulted as the third step of the Runtime
/// Selector's agent-CLI axis (§4.4).
const AGENT_RUNTIME_ENV: &str = "NANOCLAW_AGENT_RUNTIME";
/// Environment variable consulted as the third step of the Runtime
/// Selector's sandbox-engine axis (§4.4).
const SANDBOX_ENGINE_ENV: &str = "NANOCLAW_SANDBOX_ENGINE";

/// Resolve the agent CLI for a workspace (§4.4 Runtime Selector). Resolution
/// order, first match wins: the workspace's own `runtime` override, the
/// `agent_runtime` operator setting, the environment, then the default.
pub(crate) fn resolve_runtime(store: &Store, group: &RegisteredGroup) -> RuntimeKind {
    if let Some(kind) = group.runtime.as_deref().and_then(RuntimeKind::parse) {
        return kind;
    }
    if let Some(kind) = store
        .get_setting("agent_runtime")
        .ok()
        .flatten()
        .and_then(|v| RuntimeKind::parse(&v))
    {
        return kind;
    }
    if let Some(kind) = std::env::var(AGENT_RUNTIME_ENV)
        .ok()
        .and_then(|v| RuntimeKind::parse(&v))
    {
        return kind;
    }
    RuntimeKind::Claude
}

/// Resolve the sandbox engine for a workspace (§4.4 Runtime Selector).
/// Resolution order, first match wins: the workspace's `sandboxConfig.engine`
/// override, the `container_runtime` operator setting, the environment, then
/// `default_kind` (the process-wide configured default). Callers still need
/// to run the result through [`crate::container::runner::resolve_available_sandbox_kind`]
/// to apply the absent-binary fallback chain.
pub(crate) fn resolve_sandbox_kind(
    store: &Store,
    container_config: Option<&SandboxConfig>,
    default_kind: SandboxKind,
) -> SandboxKind {
    if let Some(kind) = container_config
        .and_then(|c| c.engine.as_deref())
        .and_then(SandboxKind::parse)
    {
        return kind;
    }
    if let Some(kind) = store
        .get_setting("container_runtime")
        .ok()
        .flatten()
        .and_then(|v| SandboxKind::parse(&v))
    {
        return kind;
    }
    if let Some(kind) = std::env::var(SANDBOX_ENGINE_ENV)
        .ok()
        .and_then(|v| SandboxKind::parse(&v))
    {
        return kind;
    }
    default_kind
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_group(runtime: Option<&str>) -> RegisteredGroup {
        RegisteredGroup {
            jid: "tg:123".into(),
            name: "Test".into(),
            folder: "test".into(),
            trigger: String::new(),
            added_at: String::new(),
            container_config: None,
            requires_trigger: None,
            runtime: runtime.map(|s| s.to_string()),
            model: None,
        }
    }

    #[test]
    fn resolve_runtime_defaults_to_claude() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(resolve_runtime(&store, &sample_group(None)), RuntimeKind::Claude);
    }

    #[test]
    fn resolve_runtime_opencode_from_group_override() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(
            resolve_runtime(&store, &sample_group(Some("opencode"))),
            RuntimeKind::Opencode
        );
    }

    #[test]
    fn resolve_runtime_falls_back_to_operator_setting() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("agent_runtime", "codex").unwrap();
        assert_eq!(resolve_runtime(&store, &sample_group(None)), RuntimeKind::Codex);
    }

    #[test]
    fn resolve_runtime_group_override_beats_operator_setting() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("agent_runtime", "codex").unwrap();
        assert_eq!(
            resolve_runtime(&store, &sample_group(Some("opencode"))),
            RuntimeKind::Opencode
        );
    }

    #[test]
    fn resolve_sandbox_kind_defaults_to_given_default() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(
            resolve_sandbox_kind(&store, None, SandboxKind::Container),
            SandboxKind::Container
        );
    }

    #[test]
    fn resolve_sandbox_kind_falls_back_to_operator_setting() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("container_runtime", "tart").unwrap();
        assert_eq!(
            resolve_sandbox_kind(&store, None, SandboxKind::Container),
            SandboxKind::PersistentVm
        );
    }

    #[test]
    fn resolve_sandbox_kind_workspace_override_beats_setting() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("container_runtime", "tart").unwrap();
        let config = SandboxConfig {
            additional_mounts: Vec::new(),
            timeout: None,
            engine: Some("vibe".to_string()),
        };
        assert_eq!(
            resolve_sandbox_kind(&store, Some(&config), SandboxKind::Container),
            SandboxKind::EphemeralVm
        );
    }
}
