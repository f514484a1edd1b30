//! Secrets reader: loads credentials from `.env` file and Claude OAuth token.
//!
//! Secrets are injected via container stdin and never written to disk.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

/// Secret key names for each runtime.
const SECRET_KEYS: &[&str] = &[
    // Claude
    "CLAUDE_CODE_OAUTH_TOKEN",
    "ANTHROPIC_API_KEY",
    // Opencode
    "OPENCODE_API_KEY",
    "OPENCODE_PROVIDER",
    // Codex/OpenAI
    "CODEX_OAUTH_ACCESS_TOKEN",
    "CODEX_OAUTH_REFRESH_TOKEN",
    "CODEX_OAUTH_ID_TOKEN",
    "CODEX_OAUTH_ACCOUNT_ID",
];

/// Parse a `.env` file and return values for requested keys.
/// Does NOT load into process env — callers decide what to do with values.
fn read_env_file(env_path: &Path, keys: &[&str]) -> HashMap<String, String> {
    let content = match std::fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => {
            debug!(path = %env_path.display(), ".env file not found");
            return HashMap::new();
        }
    };

    let wanted: std::collections::HashSet<&str> = keys.iter().copied().collect();
    let mut result = HashMap::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let eq_idx = match trimmed.find('=') {
            Some(i) => i,
            None => continue,
        };
        let key = trimmed[..eq_idx].trim();
        if !wanted.contains(key) {
            continue;
        }
        let mut value = trimmed[eq_idx + 1..].trim().to_string();
        // Strip surrounding quotes
        if (value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\''))
        {
            value = value[1..value.len() - 1].to_string();
        }
        if !value.is_empty() {
            result.insert(key.to_string(), value);
        }
    }

    result
}

/// Read the Claude OAuth token from `~/.claude/.credentials.json`.
/// Claude Code auto-refreshes this file, so we always get a valid token.
fn read_claude_oauth_token() -> Option<String> {
    let home = std::env::var("HOME").ok()?;
    let cred_path = Path::new(&home).join(".claude/.credentials.json");
    let content = std::fs::read_to_string(&cred_path).ok()?;
    let data: serde_json::Value = serde_json::from_str(&content).ok()?;
    let token = data
        .get("claudeAiOauth")?
        .get("accessToken")?
        .as_str()?
        .to_string();
    if token.is_empty() {
        return None;
    }
    debug!("Read Claude OAuth token from credentials file");
    Some(token)
}

/// Read all runtime secrets from `.env` and Claude OAuth credentials.
///
/// For Claude: if neither `CLAUDE_CODE_OAUTH_TOKEN` nor `ANTHROPIC_API_KEY`
/// is in `.env`, falls back to reading from `~/.claude/.credentials.json`.
pub fn read_secrets(project_root: &Path) -> HashMap<String, String> {
    let env_path = project_root.join(".env");
    let mut secrets = read_env_file(&env_path, SECRET_KEYS);

    // Auto-refresh: read Claude OAuth from credentials file if not in .env
    if !secrets.contains_key("CLAUDE_CODE_OAUTH_TOKEN")
        && !secrets.contains_key("ANTHROPIC_API_KEY")
    {
        if let Some(token) = read_claude_oauth_token() {
            secrets.insert("CLAUDE_CODE_OAUTH_TOKEN".to_string(), token);
        }
    }

    secrets
}

/// Build the Docker CLI args for running a container.
///
/// Constructs `docker run -i --rm --name {name} -e TZ=... --user ... -v ... {image}`.
pub fn build_container_args(
    mounts: &[nanoclaw_core::VolumeMount],
    container_name: &str,
    image: &str,
    timezone: &str,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];

    // Pass host timezone
    args.push("-e".to_string());
    args.push(format!("TZ={}", timezone));

    // Run as host user so bind-mounted files are accessible.
    // Skip when running as root (uid 0) or the container's node user (uid 1000).
    #[cfg(unix)]
    {
        let uid = nix_uid();
        let gid = nix_gid();
        if uid != 0 && uid != 1000 {
            args.push("--user".to_string());
            args.push(format!("{}:{}", uid, gid));
            args.push("-e".to_string());
            args.push("HOME=/home/node".to_string());
        }
    }

    for mount in mounts {
        if mount.readonly {
            args.push("-v".to_string());
            args.push(format!("{}:{}:ro", mount.host_path, mount.container_path));
        } else {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.host_path, mount.container_path));
        }

        // Overlay excluded subdirectories with empty tmpfs
        for subdir in &mount.exclude {
            args.push("--mount".to_string());
            args.push(format!(
                "type=tmpfs,destination={}/{},tmpfs-size=0",
                mount.container_path, subdir
            ));
        }
    }

    args.push(image.to_string());

    args
}

#[cfg(unix)]
fn nix_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(unix)]
fn nix_gid() -> u32 {
    unsafe { libc::getgid() }
}
