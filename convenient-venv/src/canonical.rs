//! Canonical JSON rendering
//!
//! Object keys are emitted in sorted order at every depth, arrays keep their
//! order, and no insignificant whitespace is produced. The output does not
//! depend on how the map type underneath `serde_json::Value` orders its keys.

use serde_json::Value;

/// Render a JSON value in canonical form
#[must_use]
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sorted_keys_nested() {
        let value = json!({"b": {"z": 1, "a": [3, 1]}, "a": null});
        assert_eq!(to_canonical_json(&value), r#"{"a":null,"b":{"a":[3,1],"z":1}}"#);
    }

    #[test]
    fn test_string_escaping() {
        let value = json!({"q\"uote": "line\nbreak"});
        assert_eq!(to_canonical_json(&value), r#"{"q\"uote":"line\nbreak"}"#);
    }
}
