//! Client-side orchestration for generative-AI HTTP gateways.
//!
//! The crate wraps provider APIs behind one executor with timeout, retry,
//! and cancellation semantics, decodes streaming chat responses, polls
//! async generation tasks, maps generic form data into provider-specific
//! request bodies through model schemas, and keeps a bounded sanitized
//! log of every request for diagnostics.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod request_log;
pub mod schema;
pub mod store;

pub use client::{ChatMessage, Client, GeneratedImage, GeneratedVideo, ModelInfo};
pub use config::ApiConfig;
pub use dispatch::poll::{TaskProgress, TaskState};
pub use dispatch::{RequestKind, RetryPolicy};
pub use error::EaselError;
pub use schema::{AsyncMode, FormData, FormValue, ModelSchema, RequestEncoding};
