//! Public client surface tying the pieces together: endpoint resolution,
//! schema-driven body building, execution, and result extraction.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ApiConfig;
use crate::dispatch::http::Executor;
use crate::dispatch::poll::{TaskPoller, TaskProgress, find_task_id, inline_result_url};
use crate::dispatch::sse::decode_text_stream;
use crate::dispatch::{Dispatched, RequestBody, RequestKind, RequestSpec};
use crate::error::EaselError;
use crate::request_log::RequestLog;
use crate::schema::extract::extract_results;
use crate::schema::transform::{apply_transform, form_as_body, into_multipart};
use crate::schema::{
    AsyncMode, FormData, ModelSchema, OutputSchema, RequestEncoding, get_nested,
};
use crate::store::{FileStore, KvStore};

/// One chat turn in the OpenAI-style messages array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One extracted image result.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub url: String,
    pub revised_prompt: Option<String>,
}

/// Final video result: the extracted url plus the raw terminal body for
/// callers that need provider-specific fields.
#[derive(Debug, Clone)]
pub struct GeneratedVideo {
    pub url: Option<String>,
    pub raw: Value,
}

/// One catalog entry from the models endpoint.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub raw: Value,
}

/// Provider client. Construct once and share; all methods take `&self`.
pub struct Client {
    config: ApiConfig,
    log: Arc<RequestLog>,
    executor: Executor,
}

impl Client {
    pub fn new(config: ApiConfig) -> Self {
        Self::with_store(config, Arc::new(FileStore::new()))
    }

    pub fn with_store(config: ApiConfig, store: Arc<dyn KvStore>) -> Self {
        let log = Arc::new(RequestLog::new(store));
        let executor = Executor::new(Arc::clone(&log));
        Self {
            config,
            log,
            executor,
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// The request observability log backing this client.
    pub fn log(&self) -> &Arc<RequestLog> {
        &self.log
    }

    /// Send a chat completion request and stream back text increments.
    /// The stream is lazy and single-pass; dropping it abandons the
    /// response body.
    pub async fn send_chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        cancel: Option<CancellationToken>,
    ) -> Result<BoxStream<'static, Result<String, EaselError>>, EaselError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        let spec = RequestSpec::post(
            self.config.url_for(RequestKind::Chat),
            RequestKind::Chat,
            RequestBody::Json(body),
        )
        .with_model(model)
        .with_stream(true)
        .with_cancel(cancel);

        match self.executor.execute(&self.config, &spec).await? {
            Dispatched::Stream(response) => Ok(decode_text_stream(*response).boxed()),
            Dispatched::Json(_) => Err(EaselError::Protocol(
                "expected a streaming response".to_string(),
            )),
        }
    }

    /// Generate images: transform the form through the model schema,
    /// execute, and extract the result urls.
    pub async fn generate_image(
        &self,
        form: &FormData,
        model: &str,
        schema: &ModelSchema,
    ) -> Result<Vec<GeneratedImage>, EaselError> {
        let (url, body) = self.build_generation_request(RequestKind::Image, form, schema);
        let spec = RequestSpec::post(url, RequestKind::Image, body).with_model(model);
        let body = self.expect_json(&spec).await?;

        let results = extract_results(&body, schema.output.as_ref(), RequestKind::Image);
        Ok(results.iter().filter_map(image_from_value).collect())
    }

    /// Generate a video. Depending on the schema's async mode the submit
    /// response is either the final result or a task handle that gets
    /// polled to completion, with progress published through `progress`.
    pub async fn generate_video(
        &self,
        form: &FormData,
        model: &str,
        schema: &ModelSchema,
        progress: Option<watch::Sender<TaskProgress>>,
        cancel: Option<CancellationToken>,
    ) -> Result<GeneratedVideo, EaselError> {
        let (url, body) = self.build_generation_request(RequestKind::Video, form, schema);
        let spec = RequestSpec::post(url, RequestKind::Video, body)
            .with_model(model)
            .with_cancel(cancel.clone());
        let submit = self.expect_json(&spec).await?;

        let needs_poll = match schema.async_mode {
            AsyncMode::Sync => false,
            AsyncMode::Async => true,
            AsyncMode::Auto => inline_result_url(&submit).is_none(),
        };

        let terminal = if needs_poll {
            let task_id = find_task_id(&submit).ok_or_else(|| {
                EaselError::Protocol("submit response carried no task id".to_string())
            })?;
            let status_url = format!(
                "{}/{}",
                self.config
                    .url_for(RequestKind::Video)
                    .trim_end_matches('/'),
                task_id
            );
            let mut poller = TaskPoller::new();
            if let Some(sender) = progress {
                poller = poller.with_progress(sender);
            }
            poller
                .run(&self.executor, &self.config, &task_id, &status_url, model, cancel)
                .await?
        } else {
            submit
        };

        let url = video_url(&terminal, schema.output.as_ref());
        Ok(GeneratedVideo { url, raw: terminal })
    }

    /// List the provider's model catalog.
    pub async fn fetch_models(&self) -> Result<Vec<ModelInfo>, EaselError> {
        let spec = RequestSpec::get(self.config.url_for(RequestKind::Models), RequestKind::Models);
        let body = self.expect_json(&spec).await?;

        let items = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|raw| {
                let id = raw.get("id").and_then(Value::as_str)?.to_string();
                Some(ModelInfo { id, raw })
            })
            .collect())
    }

    fn build_generation_request(
        &self,
        kind: RequestKind,
        form: &FormData,
        schema: &ModelSchema,
    ) -> (String, RequestBody) {
        let url = match schema.endpoint.as_deref() {
            Some(path) if !path.is_empty() => self.config.url_for_path(path),
            _ => self.config.url_for(kind),
        };
        let resolved = match &schema.input_transform {
            Some(template) => apply_transform(template, form),
            None => form_as_body(form),
        };
        let body = match schema.request_type {
            RequestEncoding::Json => RequestBody::Json(resolved.into_json()),
            RequestEncoding::Multipart => RequestBody::Multipart(into_multipart(resolved)),
        };
        (url, body)
    }

    async fn expect_json(&self, spec: &RequestSpec) -> Result<Value, EaselError> {
        self.executor
            .execute(&self.config, spec)
            .await?
            .into_json()
            .ok_or_else(|| EaselError::Protocol("expected a buffered response".to_string()))
    }
}

fn image_from_value(value: &Value) -> Option<GeneratedImage> {
    match value {
        Value::String(url) if !url.is_empty() => Some(GeneratedImage {
            url: url.clone(),
            revised_prompt: None,
        }),
        Value::Object(map) => {
            let url = map
                .get("url")
                .or_else(|| map.get("b64_json"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())?;
            Some(GeneratedImage {
                url: url.to_string(),
                revised_prompt: map
                    .get("revised_prompt")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        }
        _ => None,
    }
}

/// Pull the video url out of a terminal body: the output schema's field
/// when configured, otherwise a fixed fallback chain over the shapes
/// providers commonly return.
fn video_url(body: &Value, output: Option<&OutputSchema>) -> Option<String> {
    if let Some(output) = output.filter(|o| o.display_field.is_some()) {
        let extracted = extract_results(body, Some(output), RequestKind::Video)
            .into_iter()
            .find_map(|v| v.as_str().map(str::to_string));
        if extracted.is_some() {
            return extracted;
        }
    }
    ["content.video_url", "data.url", "data.0.url", "url", "video_url"]
        .iter()
        .find_map(|path| {
            get_nested(body, path)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn video_url_fallback_chain() {
        assert_eq!(
            video_url(&json!({"content": {"video_url": "a"}, "url": "b"}), None).as_deref(),
            Some("a")
        );
        assert_eq!(
            video_url(&json!({"data": {"url": "c"}}), None).as_deref(),
            Some("c")
        );
        assert_eq!(
            video_url(&json!({"data": [{"url": "d"}]}), None).as_deref(),
            Some("d")
        );
        assert_eq!(video_url(&json!({"url": "e"}), None).as_deref(), Some("e"));
        assert_eq!(
            video_url(&json!({"video_url": "f"}), None).as_deref(),
            Some("f")
        );
        assert_eq!(video_url(&json!({"status": "completed"}), None), None);
    }

    #[test]
    fn video_url_prefers_output_schema() {
        let output = OutputSchema {
            display_field: Some("result.movie".to_string()),
        };
        assert_eq!(
            video_url(
                &json!({"result": {"movie": "m"}, "url": "fallback"}),
                Some(&output)
            )
            .as_deref(),
            Some("m")
        );
    }

    #[test]
    fn image_from_object_and_string() {
        assert_eq!(
            image_from_value(&json!({"url": "u", "revised_prompt": "p"})),
            Some(GeneratedImage {
                url: "u".to_string(),
                revised_prompt: Some("p".to_string()),
            })
        );
        assert_eq!(
            image_from_value(&json!({"b64_json": "abc"})),
            Some(GeneratedImage {
                url: "abc".to_string(),
                revised_prompt: None,
            })
        );
        assert_eq!(
            image_from_value(&json!("bare-url")),
            Some(GeneratedImage {
                url: "bare-url".to_string(),
                revised_prompt: None,
            })
        );
        assert_eq!(image_from_value(&json!({"other": 1})), None);
        assert_eq!(image_from_value(&json!(42)), None);
    }
}
