//! Result extractor: normalizes a provider response body into an ordered
//! sequence of result values according to the model's output schema.
//! Total — absent or unparseable data yields an empty sequence.

use serde_json::Value;

use crate::dispatch::RequestKind;
use crate::schema::{OutputSchema, get_nested};

/// Extract result values from a response body.
///
/// With no configured field path, falls back to a kind-specific default
/// (`video_url` for video, `data` for image, none for chat) and otherwise
/// returns the whole body as a single-element sequence.
pub fn extract_results(
    body: &Value,
    output: Option<&OutputSchema>,
    kind: RequestKind,
) -> Vec<Value> {
    if body.is_null() {
        return Vec::new();
    }

    let default_field = match kind {
        RequestKind::Video => Some("video_url"),
        RequestKind::Image => Some("data"),
        _ => None,
    };
    let display_field = output
        .and_then(|o| o.display_field.as_deref())
        .or(default_field);

    let Some(path) = display_field else {
        // No path at all: unwrap a `data` envelope when present, otherwise
        // the body itself is the single result.
        if let Some(data) = body.get("data") {
            return match data {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
        }
        return vec![body.clone()];
    };

    if let Some((array_path, suffix)) = path.split_once("[]") {
        let field_path = suffix.trim_start_matches('.');

        let selected = if array_path.is_empty() {
            Some(body)
        } else {
            get_nested(body, array_path)
        };
        // Wrap a scalar selection into a one-element sequence.
        let items: Vec<&Value> = match selected {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };

        if field_path.is_empty() {
            return items.into_iter().cloned().collect();
        }
        return items
            .into_iter()
            .filter_map(|item| get_nested(item, field_path))
            .filter(|v| is_truthy(v))
            .cloned()
            .collect();
    }

    match get_nested(body, path) {
        Some(Value::Array(items)) => items.clone(),
        Some(value) if is_truthy(value) => vec![value.clone()],
        _ => Vec::new(),
    }
}

/// Falsy values are discarded from projections: null, false, empty string,
/// zero. Containers are always truthy, even when empty.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
