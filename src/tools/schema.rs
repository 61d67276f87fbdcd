//! Parameter schema validation
//!
//! Supports the JSON Schema subset tool definitions actually use: `type`
//! (single or list), `properties`, `required`, `additionalProperties: false`,
//! `enum`, `minLength` / `maxLength`, `minimum` / `maximum`, `items`,
//! `minItems` / `maxItems`. Unknown keywords are ignored.

use serde_json::Value;
use std::fmt;

/// A single schema failure at a JSON path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate `value` against `schema`, collecting every failure
pub fn validate(value: &Value, schema: &Value) -> Vec<SchemaError> {
    let mut errors = Vec::new();
    validate_at(value, schema, "$", &mut errors);
    errors
}

fn push(errors: &mut Vec<SchemaError>, path: &str, message: String) {
    errors.push(SchemaError {
        path: path.to_string(),
        message,
    });
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
            _ => false,
        },
        other => type_name(value) == other,
    }
}

fn validate_at(value: &Value, schema: &Value, path: &str, errors: &mut Vec<SchemaError>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(value, t)) {
            push(
                errors,
                path,
                format!("expected {}, got {}", allowed.join(" or "), type_name(value)),
            );
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            push(errors, path, "value is not one of the allowed options".to_string());
        }
    }

    match value {
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    push(errors, path, format!("shorter than {} characters", min));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    push(errors, path, format!("longer than {} characters", max));
                }
            }
        }
        Value::Number(n) => {
            let Some(n) = n.as_f64() else { return };
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    push(errors, path, format!("less than minimum {}", min));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    push(errors, path, format!("greater than maximum {}", max));
                }
            }
        }
        Value::Array(items) => {
            let len = items.len() as u64;
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if len < min {
                    push(errors, path, format!("fewer than {} items", min));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if len > max {
                    push(errors, path, format!("more than {} items", max));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_at(item, item_schema, &format!("{}[{}]", path, i), errors);
                }
            }
        }
        Value::Object(map) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for name in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(name) {
                        push(errors, path, format!("missing required property '{}'", name));
                    }
                }
            }

            let properties = schema.get("properties").and_then(Value::as_object);
            let closed = matches!(schema.get("additionalProperties"), Some(Value::Bool(false)));

            for (key, child) in map {
                let child_path = format!("{}.{}", path, key);
                match properties.and_then(|p| p.get(key)) {
                    Some(child_schema) => validate_at(child, child_schema, &child_path, errors),
                    None if closed => push(errors, &child_path, "unexpected property".to_string()),
                    None => {}
                }
            }
        }
        _ => {}
    }
}

/// Whether a schema is usable as a tool parameter schema (an object schema)
pub fn is_object_schema(schema: &Value) -> bool {
    match schema.get("type") {
        Some(Value::String(t)) => t == "object",
        None => schema.is_object(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "minLength": 1, "maxLength": 256},
                "encoding": {"type": "string", "enum": ["utf8", "base64"]},
                "limit": {"type": "integer", "minimum": 1, "maximum": 1000},
                "tags": {"type": "array", "items": {"type": "string"}, "maxItems": 3}
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    #[test]
    fn test_valid_parameters() {
        let params = json!({"path": "notes.txt", "encoding": "utf8", "limit": 10, "tags": ["a"]});
        assert!(validate(&params, &file_schema()).is_empty());
    }

    #[test]
    fn test_missing_required() {
        let errors = validate(&json!({}), &file_schema());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("path"));
    }

    #[test]
    fn test_wrong_type() {
        let errors = validate(&json!({"path": 42}), &file_schema());
        assert_eq!(errors[0].path, "$.path");
        assert!(errors[0].message.contains("expected string"));
    }

    #[test]
    fn test_additional_properties_rejected() {
        let errors = validate(&json!({"path": "a", "mode": "rw"}), &file_schema());
        assert_eq!(errors[0].path, "$.mode");
    }

    #[test]
    fn test_enum_and_bounds() {
        let errors = validate(
            &json!({"path": "a", "encoding": "latin1", "limit": 5000}),
            &file_schema(),
        );
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_array_items_and_length() {
        let errors = validate(
            &json!({"path": "a", "tags": ["x", 1, "y", "z"]}),
            &file_schema(),
        );
        assert!(errors.iter().any(|e| e.path == "$.tags[1]"));
        assert!(errors.iter().any(|e| e.message.contains("more than 3")));
    }

    #[test]
    fn test_integer_accepts_whole_float() {
        assert!(matches_type(&json!(3.0), "integer"));
        assert!(!matches_type(&json!(3.5), "integer"));
        assert!(matches_type(&json!(3), "number"));
    }

    #[test]
    fn test_is_object_schema() {
        assert!(is_object_schema(&file_schema()));
        assert!(!is_object_schema(&json!({"type": "string"})));
    }
}
