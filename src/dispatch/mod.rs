pub mod http;
pub mod poll;
pub mod sse;

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use crate::schema::transform::PartValue;

/// Logical request type, used for endpoint selection and log classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    Image,
    Video,
    Models,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Image => "image",
            Self::Video => "video",
            Self::Models => "models",
        }
    }
}

/// Request payload. Multipart parts are stored as data rather than a built
/// form so each retry attempt can rebuild the wire body.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<(String, PartValue)>),
}

impl RequestBody {
    /// Sanitizable JSON view of the body for the request log. File parts
    /// are represented by a placeholder token.
    pub fn preview(&self) -> Value {
        match self {
            Self::Empty => Value::Null,
            Self::Json(v) => v.clone(),
            Self::Multipart(parts) => {
                let mut map = serde_json::Map::new();
                for (name, part) in parts {
                    let shown = match part {
                        PartValue::Text(t) => Value::String(t.clone()),
                        PartValue::File(_) => Value::String("[file]".to_string()),
                    };
                    map.insert(name.clone(), shown);
                }
                Value::Object(map)
            }
        }
    }
}

/// One logical call attempt description. Immutable once constructed.
pub struct RequestSpec {
    pub url: String,
    pub method: reqwest::Method,
    pub body: RequestBody,
    /// Extra headers; an `Authorization` entry overrides the configured
    /// bearer credential.
    pub headers: Vec<(String, String)>,
    pub stream: bool,
    pub kind: RequestKind,
    /// Model key, for log attribution only.
    pub model: String,
    /// Caller-supplied cancellation. Cancels the current attempt and
    /// prevents any further retries for this logical call.
    pub cancel: Option<CancellationToken>,
}

impl RequestSpec {
    pub fn post(url: String, kind: RequestKind, body: RequestBody) -> Self {
        Self {
            url,
            method: reqwest::Method::POST,
            body,
            headers: Vec::new(),
            stream: false,
            kind,
            model: String::new(),
            cancel: None,
        }
    }

    pub fn get(url: String, kind: RequestKind) -> Self {
        Self {
            url,
            method: reqwest::Method::GET,
            body: RequestBody::Empty,
            headers: Vec::new(),
            stream: false,
            kind,
            model: String::new(),
            cancel: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_cancel(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Process-wide retry configuration. Read-only during a request's lifetime.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Per-attempt budget, covering up to response headers (and the
    /// buffered body read for non-streaming calls).
    pub timeout: Duration,
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub retryable_status: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            retryable_status: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retry number `retry` (counted from 1):
    /// base, 2×base, 4×base, …
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(retry.saturating_sub(1))
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status.contains(&status)
    }
}

/// Terminal response of one execute call.
#[derive(Debug)]
pub enum Dispatched {
    /// Fully buffered and parsed structured response.
    Json(Value),
    /// Open streaming response handle, for the streaming decoder.
    Stream(Box<reqwest::Response>),
}

impl Dispatched {
    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(v) => Some(v),
            Self::Stream(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn default_retryable_status_codes() {
        let policy = RetryPolicy::default();
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(policy.is_retryable_status(status), "{status} should retry");
        }
        assert!(!policy.is_retryable_status(400));
        assert!(!policy.is_retryable_status(401));
        assert!(!policy.is_retryable_status(404));
    }
}
