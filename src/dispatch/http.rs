use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::config::ApiConfig;
use crate::dispatch::{Dispatched, PartValue, RequestBody, RequestSpec, RetryPolicy};
use crate::error::EaselError;
use crate::request_log::{LogPatch, LogStatus, NewLogEntry, RequestLog};

/// Cap on error body excerpts carried in `Http` errors.
const ERROR_BODY_MAX: usize = 200;

/// Unified request executor: timeout, retry with exponential backoff,
/// cancellation, and request logging for one logical call.
pub struct Executor {
    client: Client,
    log: Arc<RequestLog>,
    policy: RetryPolicy,
}

impl Executor {
    pub fn new(log: Arc<RequestLog>) -> Self {
        Self::with_policy(log, RetryPolicy::default())
    }

    pub fn with_policy(log: Arc<RequestLog>, policy: RetryPolicy) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            log,
            policy,
        }
    }

    pub fn log(&self) -> &Arc<RequestLog> {
        &self.log
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Perform one logical request. Exactly one log record is written per
    /// call: created `pending` up front, moved to a terminal status on
    /// every exit path. Retries reuse the same record.
    pub async fn execute(
        &self,
        config: &ApiConfig,
        spec: &RequestSpec,
    ) -> Result<Dispatched, EaselError> {
        let start = Instant::now();

        let mut preview = spec.body.preview();
        if let Value::Object(map) = &mut preview {
            map.insert("stream".to_string(), Value::Bool(spec.stream));
        }
        let log_id = self.log.append(NewLogEntry {
            kind: spec.kind,
            method: spec.method.as_str(),
            url: &spec.url,
            model: &spec.model,
            request_preview: Some(&preview),
        });

        if spec.url.is_empty() {
            return Err(self.fail(
                &log_id,
                start,
                EaselError::Config("request URL is required".to_string()),
            ));
        }
        let has_auth_override = spec
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("authorization"));
        if config.api_key.is_empty() && !has_auth_override {
            return Err(self.fail(
                &log_id,
                start,
                EaselError::Config("API key is missing".to_string()),
            ));
        }

        let mut retries: u32 = 0;
        loop {
            let mut builder = self.client.request(spec.method.clone(), &spec.url);
            if !has_auth_override {
                builder = builder.header("Authorization", format!("Bearer {}", config.api_key));
            }
            for (name, value) in &spec.headers {
                builder = builder.header(name, value);
            }
            builder = match &spec.body {
                RequestBody::Empty => builder,
                RequestBody::Json(v) => builder.json(v),
                RequestBody::Multipart(parts) => builder.multipart(build_form(parts)),
            };

            // Combined cancellation: the caller's token or the per-attempt
            // timeout, whichever fires first, aborts the in-flight transfer.
            // Only the internal timeout is eligible for retry.
            let send = builder.send();
            let outcome = if let Some(token) = &spec.cancel {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(self.fail(
                            &log_id,
                            start,
                            EaselError::Cancelled(start.elapsed().as_millis() as u64),
                        ));
                    }
                    result = tokio::time::timeout(self.policy.timeout, send) => result,
                }
            } else {
                tokio::time::timeout(self.policy.timeout, send).await
            };

            let response = match outcome {
                Err(_) => {
                    let message =
                        format!("timed out after {}ms", self.policy.timeout.as_millis());
                    if retries < self.policy.max_retries {
                        retries += 1;
                        tracing::warn!(
                            retry = retries,
                            max = self.policy.max_retries,
                            "attempt timed out, backing off"
                        );
                        let delay = self.policy.backoff_delay(retries);
                        self.sleep_or_cancel(spec, delay, start, &log_id).await?;
                        continue;
                    }
                    return Err(self.fail(&log_id, start, EaselError::Transport(message)));
                }
                Ok(Err(e)) => {
                    if retries < self.policy.max_retries {
                        retries += 1;
                        tracing::warn!(
                            retry = retries,
                            max = self.policy.max_retries,
                            "transport error, backing off: {e}"
                        );
                        let delay = self.policy.backoff_delay(retries);
                        self.sleep_or_cancel(spec, delay, start, &log_id).await?;
                        continue;
                    }
                    return Err(self.fail(&log_id, start, EaselError::Transport(e.to_string())));
                }
                Ok(Ok(response)) => response,
            };

            let status = response.status();

            if self.policy.is_retryable_status(status.as_u16())
                && retries < self.policy.max_retries
            {
                retries += 1;
                tracing::warn!(
                    status = status.as_u16(),
                    retry = retries,
                    max = self.policy.max_retries,
                    "retryable status, backing off"
                );
                let delay = self.policy.backoff_delay(retries);
                self.sleep_or_cancel(spec, delay, start, &log_id).await?;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let excerpt: String = body.chars().take(ERROR_BODY_MAX).collect();
                return Err(self.fail(
                    &log_id,
                    start,
                    EaselError::Http {
                        status: status.as_u16(),
                        body: excerpt,
                    },
                ));
            }

            if spec.stream {
                // Streaming success is recorded at headers; consumption
                // errors are the caller's concern and never reopen this
                // record.
                self.log.update(
                    &log_id,
                    LogPatch {
                        status: Some(LogStatus::Success),
                        http_status: Some(status.as_u16()),
                        duration_ms: Some(start.elapsed().as_millis() as u64),
                        ..Default::default()
                    },
                );
                return Ok(Dispatched::Stream(Box::new(response)));
            }

            let read = tokio::time::timeout(self.policy.timeout, response.bytes());
            let outcome = if let Some(token) = &spec.cancel {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(self.fail(
                            &log_id,
                            start,
                            EaselError::Cancelled(start.elapsed().as_millis() as u64),
                        ));
                    }
                    result = read => result,
                }
            } else {
                read.await
            };
            let bytes = match outcome {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    if retries < self.policy.max_retries {
                        retries += 1;
                        tracing::warn!(retry = retries, "body read failed, backing off: {e}");
                        let delay = self.policy.backoff_delay(retries);
                        self.sleep_or_cancel(spec, delay, start, &log_id).await?;
                        continue;
                    }
                    return Err(self.fail(&log_id, start, EaselError::Transport(e.to_string())));
                }
                Err(_) => {
                    let message =
                        format!("timed out after {}ms", self.policy.timeout.as_millis());
                    if retries < self.policy.max_retries {
                        retries += 1;
                        tracing::warn!(retry = retries, "body read timed out, backing off");
                        let delay = self.policy.backoff_delay(retries);
                        self.sleep_or_cancel(spec, delay, start, &log_id).await?;
                        continue;
                    }
                    return Err(self.fail(&log_id, start, EaselError::Transport(message)));
                }
            };

            let value: Value = match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    return Err(self.fail(
                        &log_id,
                        start,
                        EaselError::Protocol(format!("failed to parse response body: {e}")),
                    ));
                }
            };

            self.log.update(
                &log_id,
                LogPatch {
                    status: Some(LogStatus::Success),
                    http_status: Some(status.as_u16()),
                    duration_ms: Some(start.elapsed().as_millis() as u64),
                    response_preview: Some(value.clone()),
                    ..Default::default()
                },
            );
            return Ok(Dispatched::Json(value));
        }
    }

    /// Backoff sleep raced against the caller's cancellation token, so a
    /// cancel during backoff prevents the next retry.
    async fn sleep_or_cancel(
        &self,
        spec: &RequestSpec,
        delay: Duration,
        start: Instant,
        log_id: &str,
    ) -> Result<(), EaselError> {
        if let Some(token) = &spec.cancel {
            tokio::select! {
                _ = token.cancelled() => {
                    Err(self.fail(
                        log_id,
                        start,
                        EaselError::Cancelled(start.elapsed().as_millis() as u64),
                    ))
                }
                _ = tokio::time::sleep(delay) => Ok(()),
            }
        } else {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }

    /// Write the terminal error state into the call's log record and hand
    /// the error back for propagation.
    fn fail(&self, log_id: &str, start: Instant, err: EaselError) -> EaselError {
        self.log.update(
            log_id,
            LogPatch {
                status: Some(LogStatus::Error),
                http_status: err.http_status(),
                duration_ms: Some(start.elapsed().as_millis() as u64),
                error_message: Some(err.to_string()),
                ..Default::default()
            },
        );
        err
    }
}

fn build_form(parts: &[(String, PartValue)]) -> Form {
    let mut form = Form::new();
    for (name, part) in parts {
        form = match part {
            PartValue::Text(text) => form.text(name.clone(), text.clone()),
            PartValue::File(file) => {
                let mut wire = Part::bytes(file.bytes.clone()).file_name(file.name.clone());
                if !file.mime.is_empty() {
                    wire = match wire.mime_str(&file.mime) {
                        Ok(typed) => typed,
                        Err(_) => Part::bytes(file.bytes.clone()).file_name(file.name.clone()),
                    };
                }
                form.part(name.clone(), wire)
            }
        };
    }
    form
}
