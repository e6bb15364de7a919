//! Input sanitization for user-supplied document bodies and filters.
//!
//! Mirrors the defensive stripping every document-store layer in the teacher
//! crate applies before composing a query: keys that look like operators are
//! never allowed to reach the database layer verbatim.

use serde_json::Value;

/// Recursively strip any object key beginning with the reserved operator
/// sigil (`$`) from a JSON value. Non-object/array values pass through
/// unchanged; this is applied at every nesting level.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if k.starts_with('$') {
                    continue;
                }
                out.insert(k.clone(), sanitize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

/// Sanitize a value that must be an object (document body or filter map).
/// Non-object input is rejected before any I/O is attempted.
pub fn sanitize_document(value: &Value) -> crate::error::Result<Value> {
    if !value.is_object() {
        return Err(crate::error::RepositoryError::validation(
            "document body must be a JSON object",
        ));
    }
    Ok(sanitize(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_top_level_operator_keys() {
        let input = json!({"name": "site", "$where": "1=1"});
        let out = sanitize_document(&input).unwrap();
        assert_eq!(out, json!({"name": "site"}));
    }

    #[test]
    fn strips_nested_and_list_operator_keys() {
        let input = json!({
            "a": {"$ne": 1, "b": 2},
            "list": [{"$gt": 1}, {"c": 3}],
        });
        let out = sanitize_document(&input).unwrap();
        assert_eq!(out, json!({"a": {"b": 2}, "list": [{}, {"c": 3}]}));
    }

    #[test]
    fn rejects_non_object_input() {
        assert!(sanitize_document(&json!([1, 2, 3])).is_err());
        assert!(sanitize_document(&json!("hello")).is_err());
    }
}
