//! Smoke integration tests for nanoclawd.
//!
//! These tests spawn the actual nanoclawd binary on a random port with a
//! minimal config (embedded SQLite, scheduler disabled, no mount allowlist),
//! then verify HTTP endpoints and CLI subcommands behave correctly. No
//! Docker, no external messaging channel — pure process + HTTP validation.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

/// Find a free port by binding to :0 and reading the assigned port.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to :0");
    listener.local_addr().unwrap().port()
}

/// Write a minimal config TOML to a temp file (scheduler disabled, store
/// and groups under the temp dir so the test never touches the workspace).
fn write_test_config(dir: &Path, port: u16) -> PathBuf {
    let config_path = dir.join("test.toml");
    let toml = format!(
        r#"
[server]
bind = "127.0.0.1:{port}"

[storage]
store_path = "nanoclaw.db"
groups_dir = "groups"

[orchestrator]
max_concurrent_containers = 1
poll_interval_ms = 60000
idle_timeout_ms = 60000
main_group_folder = "main"

[scheduler]
enabled = false
poll_interval_ms = 60000
timezone = "UTC"
"#
    );
    std::fs::write(&config_path, toml).expect("write test config");
    config_path
}

/// Build the nanoclawd binary (debug mode) and return its path.
fn nanoclawd_binary() -> PathBuf {
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
    let output = Command::new("cargo")
        .args(["build", "--bin", "nanoclawd", "--workspace"])
        .current_dir(&workspace_root)
        .output()
        .expect("cargo build");
    assert!(
        output.status.success(),
        "cargo build failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    workspace_root.join("target/debug/nanoclawd")
}

/// Spawn nanoclawd and wait for it to be ready.
struct TestServer {
    child: Child,
    base_url: String,
}

impl TestServer {
    fn start(dir: &Path, config_path: &Path, port: u16) -> Self {
        let binary = nanoclawd_binary();
        let child = Command::new(&binary)
            .args(["serve", "--config", config_path.to_str().unwrap()])
            .current_dir(dir)
            .env("RUST_LOG", "warn")
            .env("ASSISTANT_NAME", "TestBot")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("spawn nanoclawd");

        let base_url = format!("http://127.0.0.1:{port}");

        let server = TestServer { child, base_url };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let client = reqwest::blocking::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/healthz", self.base_url))
                .timeout(Duration::from_millis(200))
                .send()
                .is_ok()
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("nanoclawd did not become ready within 5 seconds");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGTERM);
            }
        }
        let _ = self.child.wait();
    }
}

#[test]
fn healthz_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(dir.path(), port);
    let server = TestServer::start(dir.path(), &config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .get(format!("{}/healthz", server.base_url))
        .send()
        .expect("GET /healthz");

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "nanoclawd");
    assert!(body["uptime_seconds"].is_number());
}

#[test]
fn readyz_reports_scheduler_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(dir.path(), port);
    let server = TestServer::start(dir.path(), &config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .get(format!("{}/readyz", server.base_url))
        .send()
        .expect("GET /readyz");

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["scheduler_enabled"], false);
    assert_eq!(body["registered_groups"], 0);
    assert_eq!(body["active_containers"], 0);
}

#[test]
fn print_config_emits_json_with_default_profiles() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(dir.path(), port);
    let binary = nanoclawd_binary();

    let output = Command::new(&binary)
        .args(["print-config", "--config", config.to_str().unwrap()])
        .current_dir(dir.path())
        .output()
        .expect("run print-config");

    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("print-config emits valid JSON");
    assert_eq!(parsed["server"]["bind"], format!("127.0.0.1:{port}"));
    assert!(parsed["runtimes"]["profiles"]["claude"].is_object());
}

#[test]
fn check_mounts_reports_missing_allowlist() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(dir.path(), port);
    let binary = nanoclawd_binary();

    let output = Command::new(&binary)
        .args(["check-mounts", "--config", config.to_str().unwrap()])
        .current_dir(dir.path())
        .env("NANOCLAW_MOUNT_ALLOWLIST", dir.path().join("nonexistent.json"))
        .output()
        .expect("run check-mounts");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("no allowlist found"));
    assert!(stdout.contains("BLOCKED"));
}
