use thiserror::Error;

#[derive(Debug, Error)]
pub enum EaselError {
    #[error("config error: {0}")]
    Config(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("task timed out after {attempts} status checks")]
    PollTimeout { attempts: u32 },

    #[error("task failed: {message}")]
    TaskFailed { message: String },
}

impl EaselError {
    /// Returns true for transient failures that may succeed on retry.
    /// Retryability of HTTP status codes is a policy decision made inside
    /// the executor, not here — `Http` is always final once surfaced.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// HTTP status carried by the error, for UI-level branching.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Human-readable message suitable for display to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(msg) => msg.clone(),
            Self::Http { status: 400, body } => {
                format!("invalid request parameters: {body}")
            }
            Self::Http { status, body } => {
                if body.trim().is_empty() {
                    format!("provider returned HTTP {status}")
                } else {
                    format!("provider returned HTTP {status}: {body}")
                }
            }
            Self::Transport(msg) => format!("network request failed: {msg}"),
            Self::Cancelled(ms) => format!("request cancelled after {ms}ms"),
            Self::Protocol(msg) => format!("unexpected provider response: {msg}"),
            Self::PollTimeout { .. } => "generation timed out".to_string(),
            Self::TaskFailed { message } => message.clone(),
        }
    }
}
