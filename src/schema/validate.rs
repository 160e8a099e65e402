//! Validation of payloads against the JSON-schema subset the registry
//! emits.
//!
//! The registry only ever produces schemas built from `type`,
//! `properties`, `required`, `additionalProperties`, `items` and `enum`,
//! so that is exactly what is checked here. With casting enabled, string
//! scalars are coerced to the target primitive type before checking
//! (`"42"` satisfies `{"type": "integer"}` and comes back as `42`).

use serde_json::{Map, Value};

/// Validate `value` against `schema`, returning the (possibly coerced)
/// value on success and a human-readable reason on failure.
pub fn validate(schema: &Value, value: &Value, cast_values: bool) -> Result<Value, String> {
    let mut checked = value.clone();
    check(schema, &mut checked, cast_values, "payload")?;
    Ok(checked)
}

fn check(schema: &Value, value: &mut Value, cast: bool, path: &str) -> Result<(), String> {
    let schema = match schema {
        // `true` accepts anything, `false` nothing.
        Value::Bool(true) => return Ok(()),
        Value::Bool(false) => return Err(format!("{path}: schema forbids any value")),
        Value::Object(obj) => obj,
        _ => return Err(format!("{path}: malformed schema")),
    };

    if let Some(expected) = schema.get("type") {
        check_type(expected, value, cast, path)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value is not one of the permitted values"));
        }
    }

    if let Some(items) = schema.get("items") {
        if let Value::Array(elements) = value {
            for (i, element) in elements.iter_mut().enumerate() {
                check(items, element, cast, &format!("{path}[{i}]"))?;
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let required = schema.get("required").and_then(Value::as_array);
    let additional = schema.get("additionalProperties");

    if properties.is_some() || required.is_some() || additional.is_some() {
        if let Value::Object(fields) = value {
            check_object(properties, required, additional, fields, cast, path)?;
        }
    }

    Ok(())
}

fn check_object(
    properties: Option<&Map<String, Value>>,
    required: Option<&Vec<Value>>,
    additional: Option<&Value>,
    fields: &mut Map<String, Value>,
    cast: bool,
    path: &str,
) -> Result<(), String> {
    if let Some(required) = required {
        for name in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(name) {
                return Err(format!("{path}.{name}: required parameter is missing"));
            }
        }
    }

    for (name, field) in fields.iter_mut() {
        let field_path = format!("{path}.{name}");
        match properties.and_then(|p| p.get(name)) {
            Some(field_schema) => check(field_schema, field, cast, &field_path)?,
            None => match additional {
                Some(Value::Bool(false)) => {
                    return Err(format!("{field_path}: unknown parameter"));
                }
                Some(Value::Bool(true)) | None => {}
                Some(extra_schema) => check(extra_schema, field, cast, &field_path)?,
            },
        }
    }

    Ok(())
}

fn check_type(expected: &Value, value: &mut Value, cast: bool, path: &str) -> Result<(), String> {
    let names: Vec<&str> = match expected {
        Value::String(s) => vec![s.as_str()],
        Value::Array(options) => options.iter().filter_map(Value::as_str).collect(),
        _ => return Err(format!("{path}: malformed type in schema")),
    };

    if names.iter().any(|name| matches(name, value)) {
        return Ok(());
    }

    if cast {
        for name in &names {
            if let Some(coerced) = coerce(name, value) {
                *value = coerced;
                return Ok(());
            }
        }
    }

    Err(format!(
        "{path}: expected {}, got {}",
        names.join(" or "),
        type_name(value)
    ))
}

fn matches(name: &str, value: &Value) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
            }
            _ => false,
        },
        "number" => value.is_number(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => false,
    }
}

/// Attempt a lossless string-to-primitive coercion.
fn coerce(name: &str, value: &Value) -> Option<Value> {
    let raw = value.as_str()?;
    match name {
        "integer" => raw.parse::<i64>().ok().map(Value::from),
        "number" => raw.parse::<f64>().ok().map(Value::from),
        "boolean" => match raw {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        "null" if raw == "null" => Some(Value::Null),
        _ => None,
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(properties: Value, required: &[&str]) -> Value {
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    #[test]
    fn test_accepts_matching_object() {
        let schema = params(
            json!({"user": {"type": "string"}, "attempts": {"type": "integer"}}),
            &["user"],
        );
        let value = json!({"user": "alice", "attempts": 3});
        assert_eq!(validate(&schema, &value, false).unwrap(), value);
    }

    #[test]
    fn test_rejects_wrong_type() {
        let schema = params(json!({"id": {"type": "integer"}}), &["id"]);
        let err = validate(&schema, &json!({"id": "not-a-number"}), false).unwrap_err();
        assert!(err.contains("expected integer"));
        assert!(err.contains("payload.id"));
    }

    #[test]
    fn test_rejects_missing_required() {
        let schema = params(json!({"user": {"type": "string"}}), &["user"]);
        let err = validate(&schema, &json!({}), false).unwrap_err();
        assert!(err.contains("required parameter is missing"));
    }

    #[test]
    fn test_rejects_unknown_parameter() {
        let schema = params(json!({"user": {"type": "string"}}), &[]);
        let err = validate(&schema, &json!({"user": "a", "extra": 1}), false).unwrap_err();
        assert!(err.contains("unknown parameter"));
    }

    #[test]
    fn test_cast_values_coerces_strings() {
        let schema = params(
            json!({"id": {"type": "integer"}, "active": {"type": "boolean"}}),
            &[],
        );
        let coerced = validate(&schema, &json!({"id": "42", "active": "true"}), true).unwrap();
        assert_eq!(coerced, json!({"id": 42, "active": true}));

        // Coercion only applies to parseable strings.
        assert!(validate(&schema, &json!({"id": "forty-two"}), true).is_err());
    }

    #[test]
    fn test_integer_accepts_whole_float() {
        let schema = json!({"type": "integer"});
        assert!(validate(&schema, &json!(42.0), false).is_ok());
        assert!(validate(&schema, &json!(42.5), false).is_err());
    }

    #[test]
    fn test_items_and_enum() {
        let schema = json!({
            "type": "array",
            "items": {"type": "string", "enum": ["on", "off"]},
        });
        assert!(validate(&schema, &json!(["on", "off"]), false).is_ok());
        let err = validate(&schema, &json!(["on", "maybe"]), false).unwrap_err();
        assert!(err.contains("payload[1]"));
    }

    #[test]
    fn test_type_union() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate(&schema, &json!("x"), false).is_ok());
        assert!(validate(&schema, &json!(null), false).is_ok());
        assert!(validate(&schema, &json!(5), false).is_err());
    }
}
