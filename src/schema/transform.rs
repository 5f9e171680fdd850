//! Template transform engine: maps generic form data into provider-specific
//! request bodies. Pure and deterministic for fixed inputs.
//!
//! Template syntax:
//! - `${field}` is replaced by the form field's value. A string that is
//!   exactly one placeholder keeps the value's original type (including
//!   binary file values); embedded placeholders interpolate as text.
//! - `${field[0]}` is single-level indexed access into a list field.
//! - `"@conditional": "field"` — the enclosing object survives only when
//!   the named field is present and non-empty.

use serde_json::{Map, Value};

use crate::schema::{FilePart, FormData, FormValue, lookup_field};

const CONDITIONAL_KEY: &str = "@conditional";
const PLACEHOLDER_OPEN: &str = "${";

/// A resolved body node. Binary file values survive resolution so they can
/// be attached as multipart file parts.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Value),
    File(FilePart),
    List(Vec<Resolved>),
    Map(Vec<(String, Resolved)>),
}

impl Resolved {
    /// Lower the tree to plain JSON for `json`-encoded bodies. Binary
    /// values have no JSON representation and become empty strings.
    pub fn into_json(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::File(_) => Value::String(String::new()),
            Self::List(items) => {
                Value::Array(items.into_iter().map(Resolved::into_json).collect())
            }
            Self::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key, value.into_json());
                }
                Value::Object(map)
            }
        }
    }
}

/// One flattened multipart form field.
#[derive(Debug, Clone, PartialEq)]
pub enum PartValue {
    Text(String),
    File(FilePart),
}

/// Resolve a transform template against form data.
pub fn apply_transform(template: &Value, data: &FormData) -> Resolved {
    resolve_node(template, data).unwrap_or(Resolved::Map(Vec::new()))
}

/// Build a body directly from form data when the schema has no template.
pub fn form_as_body(data: &FormData) -> Resolved {
    Resolved::Map(
        data.iter()
            .map(|(key, value)| (key.clone(), resolve_form_value(value)))
            .collect(),
    )
}

fn resolve_form_value(value: &FormValue) -> Resolved {
    match value {
        FormValue::File(file) => Resolved::File(file.clone()),
        FormValue::List(items) => {
            Resolved::List(items.iter().map(resolve_form_value).collect())
        }
        other => Resolved::Value(other.to_json()),
    }
}

/// Resolve one template node. None means the node was dropped by an
/// unsatisfied `@conditional` marker.
fn resolve_node(node: &Value, data: &FormData) -> Option<Resolved> {
    match node {
        Value::String(s) => Some(resolve_string(s, data)),
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                let Some(resolved) = resolve_node(item, data) else {
                    continue;
                };
                // Elements that resolve to an empty string are dropped;
                // non-string empty-ish values (an explicit 0) are kept.
                if matches!(&resolved, Resolved::Value(Value::String(s)) if s.is_empty()) {
                    continue;
                }
                out.push(resolved);
            }
            Some(Resolved::List(out))
        }
        Value::Object(map) => {
            if let Some(marker) = map.get(CONDITIONAL_KEY) {
                let field = marker.as_str().unwrap_or_default();
                if !has_value(data, field) {
                    return None;
                }
            }
            let mut entries = Vec::new();
            for (key, value) in map {
                if key == CONDITIONAL_KEY {
                    continue;
                }
                let Some(resolved) = resolve_node(value, data) else {
                    continue;
                };
                // Keys whose value resolved to an empty sequence are omitted.
                if matches!(&resolved, Resolved::List(items) if items.is_empty()) {
                    continue;
                }
                entries.push((key.clone(), resolved));
            }
            Some(Resolved::Map(entries))
        }
        other => Some(Resolved::Value(other.clone())),
    }
}

fn resolve_string(s: &str, data: &FormData) -> Resolved {
    if let Some(path) = exact_placeholder(s) {
        return match lookup_field(data, path) {
            Some(FormValue::File(file)) => Resolved::File(file.clone()),
            Some(FormValue::Text(t)) if t.is_empty() => {
                Resolved::Value(Value::String(String::new()))
            }
            Some(value) => Resolved::Value(value.to_json()),
            None => Resolved::Value(Value::String(String::new())),
        };
    }
    Resolved::Value(Value::String(interpolate(s, data)))
}

/// Returns the field path when the string is exactly one placeholder
/// spanning the whole string.
fn exact_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix(PLACEHOLDER_OPEN)?.strip_suffix('}')?;
    if !inner.is_empty() && inner.chars().all(is_path_char) {
        Some(inner)
    } else {
        None
    }
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '[' || c == ']'
}

/// Replace every embedded `${path}` with the field's text form. Absent
/// fields and binary values interpolate as the empty string.
fn interpolate(s: &str, data: &FormData) -> String {
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + PLACEHOLDER_OPEN.len()..];
        match after.find('}') {
            Some(end) if !after[..end].is_empty() && after[..end].chars().all(is_path_char) => {
                if let Some(value) = lookup_field(data, &after[..end]) {
                    out.push_str(&value.as_text());
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str(PLACEHOLDER_OPEN);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Conditional-inclusion check: present, non-null, non-empty-string,
/// non-empty-list. A binary file value always counts as present.
fn has_value(data: &FormData, path: &str) -> bool {
    lookup_field(data, path).is_some_and(|v| !v.is_empty())
}

/// Flatten a resolved top-level map into multipart form fields. Lists
/// become indexed field names (`key[0]`, `key[1]`, …), structured values
/// serialize to JSON text, binary values become file parts. Null and
/// empty-string scalars are skipped.
pub fn into_multipart(resolved: Resolved) -> Vec<(String, PartValue)> {
    let Resolved::Map(entries) = resolved else {
        return Vec::new();
    };
    let mut parts = Vec::new();
    for (key, value) in entries {
        match value {
            Resolved::List(items) => {
                for (idx, item) in items.into_iter().enumerate() {
                    let name = format!("{key}[{idx}]");
                    match item {
                        Resolved::File(file) => parts.push((name, PartValue::File(file))),
                        other => parts.push((name, PartValue::Text(part_text(other)))),
                    }
                }
            }
            Resolved::File(file) => parts.push((key, PartValue::File(file))),
            other => match other.into_json() {
                Value::Null => {}
                Value::String(s) if s.is_empty() => {}
                Value::String(s) => parts.push((key, PartValue::Text(s))),
                structured @ Value::Object(_) => {
                    let text = serde_json::to_string(&structured).unwrap_or_default();
                    parts.push((key, PartValue::Text(text)));
                }
                scalar => parts.push((key, PartValue::Text(scalar.to_string()))),
            },
        }
    }
    parts
}

fn part_text(resolved: Resolved) -> String {
    match resolved.into_json() {
        Value::String(s) => s,
        structured @ (Value::Object(_) | Value::Array(_)) => {
            serde_json::to_string(&structured).unwrap_or_default()
        }
        scalar => scalar.to_string(),
    }
}
