use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Builds `"{prefix}:{sha256}"` over the canonical JSON form of `payload`.
pub fn fingerprint<T: Serialize + ?Sized>(
    prefix: &str,
    payload: &T,
) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(payload)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{prefix}:{digest:x}"))
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json<T: Serialize + ?Sized>(payload: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(payload)?;
    serde_json::to_string(&sort_keys(value))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
