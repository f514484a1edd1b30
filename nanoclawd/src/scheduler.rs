//! Task scheduler — polls the store for due tasks and enqueues them for execution.
//!
//! The scheduler runs a poll loop every `poll_interval`, queries
//! `scheduled_tasks` for rows where `next_run <= now()` and `status =
//! 'active'`, and passes them to a callback for container execution.
//!
//! Next-run calculation supports three schedule types:
//! - `cron`: parsed via the `cron` crate with timezone support
//! - `interval`: millisecond offset from now
//! - `once`: no next run (task moves to `completed`)

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use nanoclaw_core::Store;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Configuration for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to poll for due tasks.
    pub poll_interval: Duration,
    /// IANA timezone for cron expressions (e.g., "Europe/Berlin").
    pub timezone: String,
    /// Whether the scheduler is enabled.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            timezone: "UTC".to_string(),
            enabled: false,
        }
    }
}

/// Callback invoked for each due task. The scheduler passes the task details
/// and expects the callback to enqueue container execution.
pub type TaskCallback = Box<dyn Fn(DueTask) + Send + Sync>;

/// A task that is due for execution.
#[derive(Debug, Clone)]
pub struct DueTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub context_mode: String,
}

/// Outcome of resolving a task's next run time after it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextRun {
    /// Recurring schedule — resolves to the next occurrence.
    At(String),
    /// `once` schedule — the task has no next run and is done.
    Complete,
    /// The schedule expression itself could not be resolved. Carries a
    /// human-readable reason; the task should be paused, not completed.
    Invalid(String),
}

/// Prepend a seconds field to a 5-field Unix cron expression so it parses
/// with the `cron` crate, which expects a leading seconds field.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Calculate the next run time for a task after it completes.
pub fn calculate_next_run(schedule_type: &str, schedule_value: &str, timezone: &str) -> NextRun {
    match schedule_type {
        "cron" => {
            let normalized = normalize_cron(schedule_value);
            let schedule = match cron::Schedule::from_str(&normalized) {
                Ok(s) => s,
                Err(e) => {
                    error!(cron = schedule_value, err = %e, "invalid cron expression");
                    return NextRun::Invalid(format!(
                        "invalid cron expression '{schedule_value}': {e}"
                    ));
                }
            };
            // Find next occurrence in the configured timezone
            let tz: chrono_tz::Tz = match timezone.parse() {
                Ok(t) => t,
                Err(_) => {
                    warn!(tz = timezone, "invalid timezone, falling back to UTC");
                    chrono_tz::Tz::UTC
                }
            };
            let now = Utc::now().with_timezone(&tz);
            match schedule.after(&now).next() {
                Some(dt) => NextRun::At(dt.with_timezone(&Utc).to_rfc3339()),
                None => NextRun::Invalid(format!(
                    "cron expression '{schedule_value}' has no future occurrence"
                )),
            }
        }
        "interval" => match schedule_value.parse::<u64>() {
            Ok(ms) => {
                let next = Utc::now() + chrono::Duration::milliseconds(ms as i64);
                NextRun::At(next.to_rfc3339())
            }
            Err(e) => {
                error!(value = schedule_value, err = %e, "invalid interval ms");
                NextRun::Invalid(format!("invalid interval expression '{schedule_value}': {e}"))
            }
        },
        "once" => NextRun::Complete,
        other => {
            warn!(schedule_type = other, "unknown schedule type");
            NextRun::Invalid(format!("unknown schedule type '{other}'"))
        }
    }
}

/// Format a task run result summary for storage.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    if let Some(e) = error {
        format!("Error: {e}")
    } else if let Some(r) = result {
        if r.len() > 200 {
            r[..200].to_string()
        } else {
            r.to_string()
        }
    } else {
        "Completed".to_string()
    }
}

/// Run the scheduler poll loop. Exits when `shutdown` signal fires.
pub async fn run_scheduler_loop(
    config: SchedulerConfig,
    store: Store,
    on_task: TaskCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.enabled {
        info!("scheduler disabled, skipping loop");
        return;
    }
    info!(
        poll_interval_ms = config.poll_interval.as_millis(),
        timezone = %config.timezone,
        "scheduler loop started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler loop shutting down");
                    return;
                }
            }
        }

        let now_iso = Utc::now().to_rfc3339();
        match store.due_tasks(&now_iso) {
            Ok(tasks) => {
                if !tasks.is_empty() {
                    info!(count = tasks.len(), "found due tasks");
                }
                for task in tasks {
                    // Re-verify status in case it changed between query and processing
                    match store.get_task_by_id(&task.id) {
                        Ok(Some(current)) if current.status == "active" => {
                            debug!(task_id = %current.id, group = %current.group_folder, "dispatching task");
                            on_task(DueTask {
                                id: current.id,
                                group_folder: current.group_folder,
                                chat_jid: current.chat_jid,
                                prompt: current.prompt,
                                schedule_type: current.schedule_type,
                                schedule_value: current.schedule_value,
                                context_mode: current.context_mode,
                            });
                        }
                        Ok(Some(_)) => {
                            debug!(task_id = %task.id, "task no longer active, skipping");
                        }
                        Ok(None) => {
                            debug!(task_id = %task.id, "task deleted, skipping");
                        }
                        Err(e) => {
                            error!(task_id = %task.id, err = %e, "failed to re-check task");
                        }
                    }
                }
            }
            Err(e) => {
                error!(err = %e, "failed to query due tasks");
            }
        }
    }
}
