pub mod extract;
pub mod transform;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a resolved request body is encoded on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestEncoding {
    #[default]
    Json,
    #[serde(alias = "formdata")]
    Multipart,
}

/// Whether a generation request completes inline or hands back a task id
/// to poll. `Auto` preserves the legacy behavior of polling only for the
/// video kind; `Sync`/`Async` override it per model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncMode {
    #[default]
    Auto,
    Sync,
    Async,
}

/// Output extraction descriptor. `display_field` supports dot paths and a
/// `[]` per-element marker, e.g. `data[].url`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputSchema {
    pub display_field: Option<String>,
}

/// One input field descriptor from the external model catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputField {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub default_value: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub options: Option<Value>,
}

/// Externally supplied description of a model's request shape: endpoint,
/// input fields, body template, encoding, async behavior, and output path.
/// Immutable for the duration of one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSchema {
    pub endpoint: Option<String>,
    pub input: Vec<InputField>,
    pub input_transform: Option<Value>,
    pub request_type: RequestEncoding,
    pub async_mode: AsyncMode,
    pub output: Option<OutputSchema>,
}

impl ModelSchema {
    /// Lenient schema parse. Accepts the current object format and the
    /// legacy bare-array-of-input-fields format; anything malformed falls
    /// back to the default schema rather than failing the call.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => {
                serde_json::from_value(value).unwrap_or_default()
            }
            Ok(Value::Array(_)) => {
                let input = serde_json::from_str(raw).unwrap_or_default();
                Self {
                    input,
                    ..Self::default()
                }
            }
            Ok(_) => Self::default(),
            Err(e) => {
                tracing::debug!("malformed model schema: {e}");
                Self::default()
            }
        }
    }

    /// Build default form data from the field descriptors.
    pub fn initial_form_data(&self, model: &str) -> FormData {
        let mut data = FormData::new();
        data.insert("model".to_string(), FormValue::Text(model.to_string()));

        for field in &self.input {
            let value = match &field.default_value {
                Some(v) if !matches!(v, Value::String(s) if s.is_empty()) => {
                    FormValue::from(v.clone())
                }
                _ => match field.field_type.as_str() {
                    "checkbox" | "images" => FormValue::List(Vec::new()),
                    "switch" => FormValue::Bool(false),
                    "number" | "slider" => {
                        let min = field.min.unwrap_or(0.0);
                        serde_json::Number::from_f64(min)
                            .map(FormValue::Number)
                            .unwrap_or(FormValue::Null)
                    }
                    _ => FormValue::Text(String::new()),
                },
            };
            data.insert(field.key.clone(), value);
        }
        data
    }
}

/// Binary payload attached to a form field (reference image, etc.).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// A form field value. `File` carries binary data that survives template
/// resolution and is attached as a file part under multipart encoding;
/// `Json` is a structured passthrough for values with no scalar shape.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<FormValue>),
    File(FilePart),
    Json(Value),
}

pub type FormData = BTreeMap<String, FormValue>;

impl FormValue {
    /// Absent-like values: null, empty string, empty list. A file always
    /// counts as present.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Json(Value::Null) => true,
            _ => false,
        }
    }

    /// Text coercion for string interpolation. Binary data cannot be
    /// embedded in text and interpolates as the empty string.
    pub fn as_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
            Self::List(items) => items
                .iter()
                .map(FormValue::as_text)
                .collect::<Vec<_>>()
                .join(","),
            Self::File(_) => String::new(),
            Self::Json(v) => serde_json::to_string(v).unwrap_or_default(),
        }
    }

    /// Lower to plain JSON. Binary data has no JSON representation and
    /// becomes the empty string.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Text(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(FormValue::to_json).collect()),
            Self::File(_) => Value::String(String::new()),
            Self::Json(v) => v.clone(),
        }
    }
}

impl From<Value> for FormValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(items.into_iter().map(FormValue::from).collect()),
            value @ Value::Object(_) => Self::Json(value),
        }
    }
}

impl From<&str> for FormValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FormValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FormValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<bool> for FormValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Dot-path traversal over dynamic provider JSON. Numeric segments index
/// into arrays. Returns None instead of assuming field presence.
pub fn get_nested<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Look up a form field by path: a plain name, or single-level indexed
/// access into a list field (`images[0]`). Indexing past the list's length
/// or into a non-list field yields None.
pub fn lookup_field<'a>(data: &'a FormData, path: &str) -> Option<&'a FormValue> {
    if let Some(open) = path.find('[') {
        let close = path.rfind(']')?;
        if close != path.len() - 1 {
            return None;
        }
        let index: usize = path[open + 1..close].parse().ok()?;
        match data.get(&path[..open])? {
            FormValue::List(items) => items.get(index),
            _ => None,
        }
    } else {
        data.get(path)
    }
}
