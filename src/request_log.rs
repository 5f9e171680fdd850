use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dispatch::RequestKind;
use crate::store::KvStore;

/// Maximum retained records. Oldest are evicted FIFO beyond this.
pub const MAX_LOGS: usize = 200;

/// Store key under which the full record list is persisted.
const STORAGE_KEY: &str = "request-logs";

const PROMPT_PREVIEW_MAX: usize = 200;
const STRING_PREVIEW_MAX: usize = 500;
const OBJECT_PREVIEW_MAX: usize = 800;

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Success,
    Error,
}

/// One request record. Created `pending`, moved exactly once to a terminal
/// status when the request ends; never deleted individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    /// Creation timestamp, epoch milliseconds.
    pub ts: u64,
    pub kind: String,
    pub model: String,
    pub method: String,
    pub url: String,
    pub status: LogStatus,
    pub http_status: Option<u16>,
    pub duration_ms: Option<u64>,
    pub request_preview: String,
    pub response_preview: String,
    pub error_message: String,
}

pub struct NewLogEntry<'a> {
    pub kind: RequestKind,
    pub method: &'a str,
    pub url: &'a str,
    pub model: &'a str,
    pub request_preview: Option<&'a Value>,
}

/// Terminal update for a record. Previews are sanitized/truncated on entry,
/// so applying the same patch twice leaves the record unchanged.
#[derive(Debug, Default)]
pub struct LogPatch {
    pub status: Option<LogStatus>,
    pub http_status: Option<u16>,
    pub duration_ms: Option<u64>,
    pub response_preview: Option<Value>,
    pub error_message: Option<String>,
}

/// Bounded, sanitized request log. Newest records first. The one genuinely
/// shared mutable structure in the crate: a mutex over the record list plus
/// per-record ids make concurrent append/update safe without lost updates.
pub struct RequestLog {
    records: Mutex<Vec<LogRecord>>,
    store: std::sync::Arc<dyn KvStore>,
}

impl RequestLog {
    /// Load the persisted record list (malformed stored data falls back to
    /// an empty log rather than failing).
    pub fn new(store: std::sync::Arc<dyn KvStore>) -> Self {
        let initial = store
            .get(STORAGE_KEY)
            .and_then(|raw| serde_json::from_str::<Vec<LogRecord>>(&raw).ok())
            .unwrap_or_default();
        Self {
            records: Mutex::new(initial),
            store,
        }
    }

    /// Append a new `pending` record at the front, evicting the oldest once
    /// capacity is exceeded. Returns the record id.
    pub fn append(&self, entry: NewLogEntry<'_>) -> String {
        let ts = epoch_millis();
        let seq = LOG_SEQ.fetch_add(1, Ordering::Relaxed);
        let id = format!("req_{ts}_{seq}");

        let record = LogRecord {
            id: id.clone(),
            ts,
            kind: entry.kind.as_str().to_string(),
            model: entry.model.to_string(),
            method: entry.method.to_string(),
            url: entry.url.to_string(),
            status: LogStatus::Pending,
            http_status: None,
            duration_ms: None,
            request_preview: entry.request_preview.map(sanitize_preview).unwrap_or_default(),
            response_preview: String::new(),
            error_message: String::new(),
        };

        let mut records = self.records.lock().expect("log lock poisoned");
        records.insert(0, record);
        records.truncate(MAX_LOGS);
        self.persist(&records);
        id
    }

    /// Merge a patch into the record with the given id. Unknown ids are a
    /// no-op returning false.
    pub fn update(&self, id: &str, patch: LogPatch) -> bool {
        let mut records = self.records.lock().expect("log lock poisoned");
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return false;
        };

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(http_status) = patch.http_status {
            record.http_status = Some(http_status);
        }
        if let Some(duration_ms) = patch.duration_ms {
            record.duration_ms = Some(duration_ms);
        }
        if let Some(preview) = &patch.response_preview {
            record.response_preview = sanitize_preview(preview);
        }
        if let Some(message) = patch.error_message {
            record.error_message = message;
        }

        self.persist(&records);
        true
    }

    pub fn clear(&self) {
        let mut records = self.records.lock().expect("log lock poisoned");
        records.clear();
        self.persist(&records);
    }

    /// Newest-first copy of the current records, for display.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.records.lock().expect("log lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the full list in the store. Storage failures are ignorable:
    /// the in-memory log stays authoritative for the session.
    fn persist(&self, records: &[LogRecord]) {
        match serde_json::to_string(records) {
            Ok(serialized) => {
                if let Err(e) = self.store.set(STORAGE_KEY, &serialized) {
                    tracing::debug!("request log persist failed: {e}");
                }
            }
            Err(e) => tracing::debug!("request log serialization failed: {e}"),
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Truncate to `max` characters, appending an ellipsis when shortened.
/// Character-based so multi-byte text never splits mid-codepoint.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "[unserializable]".to_string()),
    }
}

/// Redact sensitive or oversized fields before a preview is stored:
/// binary image payloads become placeholder tokens, message/image lists
/// become counts, prompts are shortened, and the whole preview is capped.
pub fn sanitize_preview(payload: &Value) -> String {
    match payload {
        Value::Null => String::new(),
        Value::String(s) => truncate(s, STRING_PREVIEW_MAX),
        Value::Array(items) => {
            let head: Vec<Value> = items.iter().take(5).cloned().collect();
            truncate(&stringify(&Value::Array(head)), OBJECT_PREVIEW_MAX)
        }
        Value::Object(map) => {
            let mut copy = map.clone();
            if copy.contains_key("image") {
                copy.insert("image".to_string(), Value::String("[image]".to_string()));
            }
            if let Some(images) = copy.get("images") {
                let count = images.as_array().map_or(1, |a| a.len());
                copy.insert(
                    "images".to_string(),
                    Value::String(format!("[images:{count}]")),
                );
            }
            if let Some(messages) = copy.get("messages") {
                let count = messages.as_array().map_or(0, |a| a.len());
                copy.insert(
                    "messages".to_string(),
                    Value::String(format!("[messages:{count}]")),
                );
            }
            if let Some(Value::String(prompt)) = copy.get("prompt") {
                let shortened = truncate(prompt, PROMPT_PREVIEW_MAX);
                copy.insert("prompt".to_string(), Value::String(shortened));
            }
            truncate(&stringify(&Value::Object(copy)), OBJECT_PREVIEW_MAX)
        }
        other => truncate(&stringify(other), OBJECT_PREVIEW_MAX),
    }
}
