//! Async task polling for providers that return a task id instead of an
//! inline result. The submit response hands back an id; the poller checks
//! the task's status endpoint on a fixed cadence until it reaches a
//! terminal state or the attempt budget runs out.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ApiConfig;
use crate::dispatch::http::Executor;
use crate::dispatch::{RequestKind, RequestSpec};
use crate::error::EaselError;

pub const MAX_POLL_ATTEMPTS: u32 = 120;
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

const TASK_ID_KEYS: [&str; 3] = ["id", "task_id", "taskId"];
const SUCCESS_TOKENS: [&str; 2] = ["completed", "succeeded"];
const FAILURE_TOKENS: [&str; 2] = ["failed", "error"];
const FALLBACK_FAILURE: &str = "task failed without an error message";

/// Lifecycle of one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Submitted,
    Polling,
    Completed,
    Failed,
    TimedOut,
}

/// Tracking record for one task while it is being polled.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: String,
    pub created: Instant,
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: TaskState,
}

impl TaskHandle {
    pub fn new(id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            id: id.into(),
            created: Instant::now(),
            attempt: 0,
            max_attempts,
            state: TaskState::Submitted,
        }
    }

    /// Synthetic progress for display. Capped at 99 until the task actually
    /// completes; only completion reports 100.
    pub fn percentage(&self) -> u32 {
        if self.state == TaskState::Completed {
            return 100;
        }
        let max = self.max_attempts.max(1);
        let ratio = f64::from(self.attempt) * 100.0 / f64::from(max);
        (ratio.round() as u32).min(99)
    }

    pub fn progress(&self) -> TaskProgress {
        TaskProgress {
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            percentage: self.percentage(),
        }
    }
}

/// Snapshot published through the progress channel after every poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskProgress {
    pub attempt: u32,
    pub max_attempts: u32,
    pub percentage: u32,
}

/// What one status body means for the task.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    InProgress,
    Completed(Value),
    Failed(String),
}

/// Locate the task id in a submit response. Providers disagree on the key
/// and on whether the id is a string or a number; some nest it under a
/// `data` envelope.
pub fn find_task_id(body: &Value) -> Option<String> {
    for scope in [Some(body), body.get("data")].into_iter().flatten() {
        for key in TASK_ID_KEYS {
            match scope.get(key) {
                Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                Some(Value::Number(n)) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

/// A submit response that already carries a result url needs no polling.
pub fn inline_result_url(body: &Value) -> Option<String> {
    let candidates = [
        body.pointer("/data/url"),
        body.get("url"),
        body.pointer("/data/0/url"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Classify one status body. With no status token at all, a body that
/// already carries a result counts as completed; otherwise the task is
/// assumed to still be running.
pub fn classify_status(body: &Value) -> PollOutcome {
    let status = body
        .get("status")
        .or_else(|| body.pointer("/data/status"))
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);

    match status {
        Some(token) if SUCCESS_TOKENS.contains(&token.as_str()) => {
            PollOutcome::Completed(body.clone())
        }
        Some(token) if FAILURE_TOKENS.contains(&token.as_str()) => {
            PollOutcome::Failed(failure_message(body))
        }
        Some(_) => PollOutcome::InProgress,
        None => {
            let has_result = inline_result_url(body).is_some()
                || body.get("data").is_some_and(|d| !d.is_null());
            if has_result {
                PollOutcome::Completed(body.clone())
            } else {
                PollOutcome::InProgress
            }
        }
    }
}

fn failure_message(body: &Value) -> String {
    body.pointer("/error/message")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map_or_else(|| FALLBACK_FAILURE.to_string(), str::to_string)
}

/// Fixed-cadence status poller. The first check is immediate; cancellation
/// is inherited from each status request, so a cancelled poll fails the
/// whole operation.
pub struct TaskPoller {
    max_attempts: u32,
    interval: Duration,
    progress: Option<watch::Sender<TaskProgress>>,
}

impl Default for TaskPoller {
    fn default() -> Self {
        Self {
            max_attempts: MAX_POLL_ATTEMPTS,
            interval: POLL_INTERVAL,
            progress: None,
        }
    }
}

impl TaskPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_progress(mut self, sender: watch::Sender<TaskProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Poll until the task completes, fails, or the attempt budget is
    /// exhausted. Returns the final status body on completion.
    pub async fn run(
        &self,
        executor: &Executor,
        config: &ApiConfig,
        task_id: &str,
        status_url: &str,
        model: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<Value, EaselError> {
        let mut handle = TaskHandle::new(task_id, self.max_attempts);
        tracing::info!(task = %handle.id, "polling task status");

        while handle.attempt < handle.max_attempts {
            if handle.attempt > 0 {
                tokio::time::sleep(self.interval).await;
            }
            handle.attempt += 1;
            handle.state = TaskState::Polling;
            self.publish(&handle);

            let spec = RequestSpec::get(status_url.to_string(), RequestKind::Video)
                .with_model(model)
                .with_cancel(cancel.clone());
            let body = executor
                .execute(config, &spec)
                .await?
                .into_json()
                .ok_or_else(|| {
                    EaselError::Protocol("expected a buffered status response".to_string())
                })?;

            match classify_status(&body) {
                PollOutcome::InProgress => {
                    tracing::debug!(task = %handle.id, attempt = handle.attempt, "task in progress");
                }
                PollOutcome::Completed(body) => {
                    handle.state = TaskState::Completed;
                    self.publish(&handle);
                    tracing::info!(
                        task = %handle.id,
                        attempt = handle.attempt,
                        elapsed_ms = handle.created.elapsed().as_millis() as u64,
                        "task completed"
                    );
                    return Ok(body);
                }
                PollOutcome::Failed(message) => {
                    handle.state = TaskState::Failed;
                    self.publish(&handle);
                    tracing::warn!(task = %handle.id, attempt = handle.attempt, "task failed: {message}");
                    return Err(EaselError::TaskFailed { message });
                }
            }
        }

        handle.state = TaskState::TimedOut;
        self.publish(&handle);
        tracing::warn!(task = %handle.id, attempts = handle.max_attempts, "task polling exhausted");
        Err(EaselError::PollTimeout {
            attempts: handle.max_attempts,
        })
    }

    fn publish(&self, handle: &TaskHandle) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(handle.progress());
        }
    }
}
