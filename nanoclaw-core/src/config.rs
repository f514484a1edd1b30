use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NanoclawConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub runtimes: RuntimeConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
    pub mounts: MountsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7340".to_string(),
            request_timeout_ms: 30_000,
            max_body_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the embedded SQLite database file.
    pub store_path: String,
    /// Directory containing per-group workspace folders.
    pub groups_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_path: "store/nanoclaw.db".to_string(),
            groups_dir: "groups".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub default_runtime: String,
    pub profiles: BTreeMap<String, RuntimeProfile>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "claude".to_string(),
            RuntimeProfile {
                provider: "anthropic".to_string(),
                default_model: "claude-opus-4-6".to_string(),
                required_env: vec!["CLAUDE_CODE_OAUTH_TOKEN".to_string()],
            },
        );
        profiles.insert(
            "opencode".to_string(),
            RuntimeProfile {
                provider: "opencode".to_string(),
                default_model: "opencode/grok-code".to_string(),
                required_env: vec![
                    "OPENCODE_API_KEY".to_string(),
                    "OPENCODE_PROVIDER".to_string(),
                ],
            },
        );
        profiles.insert(
            "codex".to_string(),
            RuntimeProfile {
                provider: "openai".to_string(),
                default_model: "gpt-5.3-codex".to_string(),
                required_env: vec![
                    "CODEX_OAUTH_ACCESS_TOKEN".to_string(),
                    "CODEX_OAUTH_REFRESH_TOKEN".to_string(),
                    "CODEX_OAUTH_ID_TOKEN".to_string(),
                    "CODEX_OAUTH_ACCOUNT_ID".to_string(),
                ],
            },
        );

        Self {
            default_runtime: "claude".to_string(),
            profiles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeProfile {
    pub provider: String,
    pub default_model: String,
    pub required_env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrent sandboxes across all groups.
    pub max_concurrent_containers: usize,
    /// Poll interval for the message loop (milliseconds).
    pub poll_interval_ms: u64,
    /// Idle timeout before closing sandbox stdin (milliseconds).
    pub idle_timeout_ms: u64,
    /// Folder name for the main group.
    pub main_group_folder: String,
    /// Which sandbox engine to use: container, ephemeral_vm, persistent_vm, in_process.
    pub container_runtime: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_containers: 3,
            poll_interval_ms: 1000,
            idle_timeout_ms: 300_000,
            main_group_folder: "main".to_string(),
            container_runtime: "container".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 10_000,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountsConfig {
    /// Path to the external mount allowlist JSON file.
    pub allowlist_path: Option<String>,
}

impl Default for MountsConfig {
    fn default() -> Self {
        Self { allowlist_path: None }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<NanoclawConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(NanoclawConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: NanoclawConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl NanoclawConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = std::env::var("NANOCLAWD_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind = bind;
            }
        }

        if let Ok(path) = std::env::var("NANOCLAW_STORE_PATH") {
            if !path.trim().is_empty() {
                self.storage.store_path = path;
            }
        }

        if let Ok(path) = std::env::var("NANOCLAW_MOUNT_ALLOWLIST") {
            if !path.trim().is_empty() {
                self.mounts.allowlist_path = Some(path);
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_three_runtime_profiles() {
        let cfg = NanoclawConfig::default();
        assert!(cfg.runtimes.profiles.contains_key("claude"));
        assert!(cfg.runtimes.profiles.contains_key("opencode"));
        assert!(cfg.runtimes.profiles.contains_key("codex"));
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: NanoclawConfig = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:9999"
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.server.bind, "127.0.0.1:9999");
        assert_eq!(parsed.server.request_timeout_ms, 30_000);
        assert!(parsed.runtimes.profiles.contains_key("claude"));
    }

    #[test]
    fn storage_defaults_to_embedded_sqlite_path() {
        let cfg = NanoclawConfig::default();
        assert_eq!(cfg.storage.store_path, "store/nanoclaw.db");
    }
}
