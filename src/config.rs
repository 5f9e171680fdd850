use std::env;
use std::path::Path;

use serde::Deserialize;

use crate::dispatch::RequestKind;
use crate::error::EaselError;

pub const DEFAULT_CHAT_ENDPOINT: &str = "/chat/completions";
pub const DEFAULT_IMAGE_ENDPOINT: &str = "/images/generations";
pub const DEFAULT_VIDEO_ENDPOINT: &str = "/videos/generations";
pub const DEFAULT_MODELS_ENDPOINT: &str = "/models";

/// Endpoint paths per logical request kind, relative to the base URL.
/// An entry starting with `http://` or `https://` is used verbatim.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub chat: String,
    pub image: String,
    pub video: String,
    pub models: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            chat: DEFAULT_CHAT_ENDPOINT.to_string(),
            image: DEFAULT_IMAGE_ENDPOINT.to_string(),
            video: DEFAULT_VIDEO_ENDPOINT.to_string(),
            models: DEFAULT_MODELS_ENDPOINT.to_string(),
        }
    }
}

/// Connection settings for one provider gateway: base URL, bearer credential,
/// endpoint table. Constructed once and passed by reference into the
/// orchestration components — no ambient globals.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub endpoints: Endpoints,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            endpoints: Endpoints::default(),
        }
    }

    /// Read configuration from the environment. `.env` files are honored.
    /// Missing keys produce an unconfigured instance — the executor rejects
    /// requests with a `Config` error when it actually needs the values.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut endpoints = Endpoints::default();
        if let Ok(v) = env::var("EASEL_CHAT_ENDPOINT") {
            endpoints.chat = v;
        }
        if let Ok(v) = env::var("EASEL_IMAGE_ENDPOINT") {
            endpoints.image = v;
        }
        if let Ok(v) = env::var("EASEL_VIDEO_ENDPOINT") {
            endpoints.video = v;
        }
        if let Ok(v) = env::var("EASEL_MODELS_ENDPOINT") {
            endpoints.models = v;
        }

        Self {
            base_url: env::var("EASEL_BASE_URL").unwrap_or_default(),
            api_key: env::var("EASEL_API_KEY").unwrap_or_default(),
            endpoints,
        }
    }

    /// Load configuration from a TOML file:
    ///
    /// ```toml
    /// base_url = "https://api.example.com/v1"
    /// api_key = "sk-..."
    ///
    /// [endpoints]
    /// chat = "/chat/completions"
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EaselError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EaselError::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&raw)
            .map_err(|e| EaselError::Config(format!("failed to parse config file: {e}")))
    }

    pub fn endpoint(&self, kind: RequestKind) -> &str {
        match kind {
            RequestKind::Chat => &self.endpoints.chat,
            RequestKind::Image => &self.endpoints.image,
            RequestKind::Video => &self.endpoints.video,
            RequestKind::Models => &self.endpoints.models,
        }
    }

    /// Full URL for a logical request kind.
    pub fn url_for(&self, kind: RequestKind) -> String {
        join_url(&self.base_url, self.endpoint(kind))
    }

    /// Full URL for a schema-supplied endpoint path.
    pub fn url_for_path(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

/// Join a base URL and an endpoint path without doubling slashes.
/// Absolute endpoints pass through unchanged.
pub fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let base = base.trim_end_matches('/');
    let path = endpoint.trim_start_matches('/');
    format!("{base}/{path}")
}
