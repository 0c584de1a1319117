use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Resolution failures. The Coordinator logs these and publishes the
/// unresolved original so the worker surfaces a clearer error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("unresolved reference '{reference}'")]
    UnresolvedReference { reference: String },
}

const NODES_PREFIX: &str = "$nodes.";

/// Node ids referenced anywhere in `value` (both `$nodes.X` forms and
/// `${…}` interpolations). The Coordinator fetches exactly these outputs
/// before calling [`resolve`].
pub fn referenced_nodes(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    walk_references(value, &mut out);
    out
}

fn walk_references(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix(NODES_PREFIX) {
                out.insert(node_segment(rest).to_string());
            }
            let mut cursor = s.as_str();
            while let Some(start) = cursor.find("${") {
                let Some(end) = cursor[start..].find('}') else {
                    break;
                };
                let inner = &cursor[start + 2..start + end];
                if let Some(rest) = inner.strip_prefix(NODES_PREFIX) {
                    out.insert(node_segment(rest).to_string());
                }
                cursor = &cursor[start + end + 1..];
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_references(item, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                walk_references(v, out);
            }
        }
        _ => {}
    }
}

/// Resolve every `$nodes.*` reference and `${…}` interpolation in `value`
/// against `outputs` (node id -> deserialized output).
///
/// Whole-string references substitute the referenced value with its
/// original type; interpolations render non-string substitutions to
/// canonical JSON.
pub fn resolve(
    value: &Value,
    outputs: &BTreeMap<String, Value>,
) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => resolve_string(s, outputs),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>, ResolveError> =
                items.iter().map(|v| resolve(v, outputs)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve(v, outputs)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    s: &str,
    outputs: &BTreeMap<String, Value>,
) -> Result<Value, ResolveError> {
    // Whole-string reference keeps the referenced value's type.
    if let Some(rest) = s.strip_prefix(NODES_PREFIX) {
        if !s.contains("${") {
            return lookup(rest, outputs);
        }
    }

    if !s.contains("${") {
        return Ok(Value::String(s.to_string()));
    }

    // Interpolation: replace each ${$nodes.…} span, rendering non-strings
    // to canonical JSON. Unknown ${…} spans pass through untouched.
    let mut rendered = String::with_capacity(s.len());
    let mut cursor = s;
    while let Some(start) = cursor.find("${") {
        rendered.push_str(&cursor[..start]);
        let after = &cursor[start..];
        let Some(end) = after.find('}') else {
            rendered.push_str(after);
            cursor = "";
            break;
        };
        let inner = &after[2..end];
        if let Some(rest) = inner.strip_prefix(NODES_PREFIX) {
            let substituted = lookup(rest, outputs)?;
            match substituted {
                Value::String(text) => rendered.push_str(&text),
                other => rendered.push_str(&canonical(&other)),
            }
        } else {
            rendered.push_str(&after[..=end]);
        }
        cursor = &after[end + 1..];
    }
    rendered.push_str(cursor);
    Ok(Value::String(rendered))
}

/// Resolve `X.a.b[0]` (the part after `$nodes.`) against the output map.
fn lookup(rest: &str, outputs: &BTreeMap<String, Value>) -> Result<Value, ResolveError> {
    let node = node_segment(rest);
    let output = outputs
        .get(node)
        .ok_or_else(|| ResolveError::UnresolvedReference {
            reference: format!("{NODES_PREFIX}{rest}"),
        })?;

    let path = &rest[node.len()..];
    if path.is_empty() {
        return Ok(output.clone());
    }

    let jsonpath = format!("${path}");
    let matches =
        jsonpath_lib::select(output, &jsonpath).map_err(|_| ResolveError::UnresolvedReference {
            reference: format!("{NODES_PREFIX}{rest}"),
        })?;
    match matches.first() {
        Some(v) => Ok((*v).clone()),
        None => Err(ResolveError::UnresolvedReference {
            reference: format!("{NODES_PREFIX}{rest}"),
        }),
    }
}

/// The node-id segment of `X.a.b[0]`: up to the first `.` or `[`.
fn node_segment(rest: &str) -> &str {
    let end = rest
        .find(|c| c == '.' || c == '[')
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Canonical string form for interpolated non-string values.
fn canonical(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
