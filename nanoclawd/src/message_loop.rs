//! Message poll loop — polls the store for new messages and dispatches to GroupQueue.
//!
//! Dual-cursor design:
//! - `last_timestamp` (global): advances when ANY messages are fetched. Prevents re-fetching.
//! - `last_agent_timestamp` (per-group): advances when messages are dispatched to a container.
//!   Accumulated context between triggers is preserved.
//!
//! On startup, `recover_pending_messages()` re-enqueues groups with unprocessed messages
//! (handles crash between advancing last_timestamp and agent dispatch).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use nanoclaw_core::{ConversationMessage, RegisteredGroup, Store};
use regex::Regex;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::queue::GroupQueue;

/// Configuration for the message loop.
#[derive(Debug, Clone)]
pub struct MessageLoopConfig {
    /// Poll interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Bot/assistant name prefix used to filter out bot messages and detect triggers.
    pub assistant_name: String,
    /// Folder name for the main group (e.g., "main"). Main group doesn't require trigger.
    pub main_group_folder: String,
}

/// Per-group cursor state. Stored in router_state as JSON.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct AgentTimestamps(pub HashMap<String, String>);

/// Run the message poll loop. Exits when shutdown signal fires.
pub async fn run_message_loop(
    config: MessageLoopConfig,
    store: Store,
    queue: Arc<GroupQueue>,
    groups: Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis(config.poll_interval_ms);

    // Load cursor state from the store
    let mut last_timestamp = load_cursor(&store, "last_timestamp");
    let mut agent_timestamps = load_agent_timestamps(&store);

    info!(
        poll_interval_ms = config.poll_interval_ms,
        last_timestamp = %last_timestamp,
        agent_cursors = agent_timestamps.0.len(),
        "message loop started"
    );

    // Run recovery before entering the main loop
    recover_pending_messages(
        &store,
        &queue,
        &groups,
        &agent_timestamps,
        &config.assistant_name,
        &config.main_group_folder,
    )
    .await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("message loop shutting down");
                    return;
                }
            }
        }

        if let Err(e) = poll_once(
            &config,
            &store,
            &queue,
            &groups,
            &mut last_timestamp,
            &mut agent_timestamps,
        )
        .await
        {
            error!(err = %e, "error in message poll");
        }
    }
}

/// Single poll iteration. Extracted for testability.
async fn poll_once(
    config: &MessageLoopConfig,
    store: &Store,
    queue: &GroupQueue,
    groups: &RwLock<HashMap<String, RegisteredGroup>>,
    last_timestamp: &mut String,
    agent_timestamps: &mut AgentTimestamps,
) -> anyhow::Result<()> {
    let groups_guard = groups.read().await;
    let jids: Vec<String> = groups_guard.keys().cloned().collect();
    drop(groups_guard);

    if jids.is_empty() {
        return Ok(());
    }

    let (messages, new_timestamp) =
        store.get_new_messages(&jids, last_timestamp, &config.assistant_name)?;

    if messages.is_empty() {
        return Ok(());
    }

    info!(count = messages.len(), "new messages");

    // Advance the global "seen" cursor immediately
    *last_timestamp = new_timestamp;
    save_cursor(store, "last_timestamp", last_timestamp);

    // Group messages by chat JID
    let mut by_group: HashMap<String, Vec<ConversationMessage>> = HashMap::new();
    for (chat_jid, msg) in messages {
        by_group.entry(chat_jid).or_default().push(msg);
    }

    let groups_guard = groups.read().await;

    for (chat_jid, group_messages) in by_group {
        let group = match groups_guard.get(&chat_jid) {
            Some(g) => g,
            None => continue,
        };

        let is_main = group.folder == config.main_group_folder;
        let needs_trigger = !is_main && group.requires_trigger.unwrap_or(true);

        // For non-main groups, only act on trigger messages.
        // Non-trigger messages accumulate in the store; they'll be pulled as
        // context when a trigger eventually arrives.
        if needs_trigger {
            let trigger_pattern = build_trigger_regex(&config.assistant_name, if group.trigger.is_empty() { None } else { Some(group.trigger.as_str()) });
            let has_trigger = group_messages
                .iter()
                .any(|m| trigger_pattern.is_match(m.content.trim()));
            if !has_trigger {
                continue;
            }
        }

        // Try to pipe to active container first
        let agent_since = agent_timestamps
            .0
            .get(&chat_jid)
            .cloned()
            .unwrap_or_default();

        // Pull ALL messages since last agent timestamp (includes accumulated context)
        let all_pending = store
            .get_messages_since(&chat_jid, &agent_since, &config.assistant_name)
            .unwrap_or_default();

        let messages_to_use = if all_pending.is_empty() {
            &group_messages
        } else {
            &all_pending
        };

        let formatted = format_messages(messages_to_use);

        if queue.send_message(&chat_jid, &formatted).await {
            debug!(
                chat_jid = chat_jid.as_str(),
                count = messages_to_use.len(),
                "piped messages to active container"
            );
            // Advance per-group cursor
            if let Some(last) = messages_to_use.last() {
                agent_timestamps
                    .0
                    .insert(chat_jid.clone(), last.timestamp.clone());
                save_agent_timestamps(store, agent_timestamps);
            }
        } else {
            // No active container — enqueue for processing
            queue.enqueue_message_check(&chat_jid).await;
        }
    }

    Ok(())
}

/// Startup recovery: check for unprocessed messages in registered groups.
async fn recover_pending_messages(
    store: &Store,
    queue: &GroupQueue,
    groups: &RwLock<HashMap<String, RegisteredGroup>>,
    agent_timestamps: &AgentTimestamps,
    assistant_name: &str,
    main_group_folder: &str,
) {
    let groups_guard = groups.read().await;
    for (chat_jid, group) in groups_guard.iter() {
        let since = agent_timestamps
            .0
            .get(chat_jid)
            .cloned()
            .unwrap_or_default();
        let pending = match store.get_messages_since(chat_jid, &since, assistant_name) {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!(chat_jid, err = %e, "recovery: failed to check pending messages");
                continue;
            }
        };

        if !pending.is_empty() {
            let is_main = group.folder == main_group_folder;
            let needs_trigger = !is_main && group.requires_trigger.unwrap_or(true);

            if needs_trigger {
                let trigger_pattern = build_trigger_regex(assistant_name, if group.trigger.is_empty() { None } else { Some(group.trigger.as_str()) });
                let has_trigger = pending.iter().any(|m| trigger_pattern.is_match(m.content.trim()));
                if !has_trigger {
                    continue;
                }
            }

            info!(
                group = group.name.as_str(),
                pending_count = pending.len(),
                "recovery: enqueuing unprocessed messages"
            );
            queue.enqueue_message_check(chat_jid).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Cursor persistence
// ---------------------------------------------------------------------------

fn load_cursor(store: &Store, key: &str) -> String {
    match store.get_router_state(key) {
        Ok(Some(v)) => v,
        Ok(None) => String::new(),
        Err(e) => {
            warn!(key, err = %e, "failed to load cursor, starting from empty");
            String::new()
        }
    }
}

fn save_cursor(store: &Store, key: &str, value: &str) {
    if let Err(e) = store.set_router_state(key, value) {
        error!(key, err = %e, "failed to save cursor");
    }
}

/// Public wrapper for loading agent timestamps (used by process_group).
pub fn load_agent_timestamps_pub(store: &Store) -> anyhow::Result<AgentTimestamps> {
    Ok(load_agent_timestamps(store))
}

/// Public wrapper for saving agent timestamps (used by process_group).
pub fn save_agent_timestamps_pub(store: &Store, timestamps: &AgentTimestamps) -> anyhow::Result<()> {
    save_agent_timestamps(store, timestamps);
    Ok(())
}

/// Public wrapper for building trigger regex (used by process_group).
pub fn build_trigger_regex_pub(assistant_name: &str, custom_trigger: Option<&str>) -> regex::Regex {
    build_trigger_regex(assistant_name, custom_trigger)
}

/// Public wrapper for formatting messages (used by process_group).
pub fn format_messages_pub(messages: &[ConversationMessage]) -> String {
    format_messages(messages)
}

fn load_agent_timestamps(store: &Store) -> AgentTimestamps {
    match store.get_router_state("last_agent_timestamp") {
        Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
        Ok(None) => AgentTimestamps::default(),
        Err(e) => {
            warn!(err = %e, "failed to load agent timestamps, starting from empty");
            AgentTimestamps::default()
        }
    }
}

fn save_agent_timestamps(store: &Store, timestamps: &AgentTimestamps) {
    let json = serde_json::to_string(timestamps).unwrap_or_else(|_| "{}".into());
    if let Err(e) = store.set_router_state("last_agent_timestamp", &json) {
        error!(err = %e, "failed to save agent timestamps");
    }
}

// ---------------------------------------------------------------------------
// Message formatting
// ---------------------------------------------------------------------------

/// Format messages into the `<messages>` prompt envelope handed to the container agent.
///
/// Each message becomes `<message sender="NAME" time="ISO-8601">CONTENT</message>`,
/// with `&`, `<`, `>` and `"` escaped in both attributes and body text.
fn format_messages(messages: &[ConversationMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut out = String::from("<messages>");
    for m in messages {
        let _ = write!(
            out,
            "<message sender=\"{}\" time=\"{}\">{}</message>",
            escape_xml(&m.sender_name),
            escape_xml(&m.timestamp),
            escape_xml(&m.content),
        );
    }
    out.push_str("</messages>");
    out
}

/// Escape the characters XML requires escaping in attribute values and text content.
fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Build a trigger regex that matches `@AssistantName` at word boundary.
/// If the group has a custom trigger, use that as an additional pattern.
fn build_trigger_regex(assistant_name: &str, custom_trigger: Option<&str>) -> Regex {
    let escaped = regex::escape(assistant_name);
    let pattern = if let Some(trigger) = custom_trigger {
        if trigger.is_empty() {
            format!(r"(?i)^@{}\b", escaped)
        } else {
            let escaped_trigger = regex::escape(trigger);
            format!(r"(?i)^@{}\b|^{}\b", escaped, escaped_trigger)
        }
    } else {
        format!(r"(?i)^@{}\b", escaped)
    };

    Regex::new(&pattern).unwrap_or_else(|_| {
        // Fallback to simple prefix match
        Regex::new(&format!(r"(?i)^@{}", regex::escape(assistant_name))).unwrap()
    })
}
