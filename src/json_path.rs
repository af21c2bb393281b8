//! Dotted path lookup into JSON documents.
//!
//! Paths look like `items.0.id`. A leading `$.` and bracketed indexes
//! (`items[0].id`) are accepted and normalised to the dotted form.

use serde_json::Value;

/// Resolve `path` inside `json`. An empty path (or `$`) yields the
/// document itself.
pub fn get_by_path<'a>(json: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = normalize(path);
    let mut current = json;

    for part in normalized.split('.') {
        if part.is_empty() {
            continue;
        }

        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(array) => {
                let index = part.parse::<usize>().ok()?;
                current = array.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

/// Parse `body` as JSON and resolve `path`, rendering the result as a
/// plain string. Malformed JSON and missing paths both yield `None`.
pub fn lookup_str(body: &str, path: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    get_by_path(&json, path).map(value_to_string)
}

/// Strings are returned without quotes; everything else uses its
/// compact JSON form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    let trimmed = trimmed
        .strip_prefix("$.")
        .or_else(|| trimmed.strip_prefix('$'))
        .unwrap_or(trimmed);
    trimmed.replace('[', ".").replace(']', "")
}
