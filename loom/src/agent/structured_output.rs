//! Structured output extraction and shape-only validation (spec.md §4.4).
//!
//! Validation never recurses past one property level and never rejects
//! extra properties — it only confirms the schema's `required` fields are
//! present and that declared primitive types match at the top level.

use serde_json::Value;

/// Extracts a structured output object from a message of unknown shape.
///
/// - No `content` field → the value as-is.
/// - `content` is a string → parsed as JSON, falling back to `{content: s}`.
/// - `content` is an object → that object.
/// - The message itself is a string → parsed as JSON with the same fallback.
pub fn extract(message: &Value) -> Value {
    match message {
        Value::String(s) => parse_or_wrap(s),
        Value::Object(map) => match map.get("content") {
            None => message.clone(),
            Some(Value::String(s)) => parse_or_wrap(s),
            Some(content) => content.clone(),
        },
        other => other.clone(),
    }
}

fn parse_or_wrap(s: &str) -> Value {
    serde_json::from_str::<Value>(s).unwrap_or_else(|_| serde_json::json!({"content": s}))
}

/// Shape-only validation against a JSON-Schema-shaped object: `required`
/// fields must be present, and each declared property's runtime type must
/// match `schema.properties.<name>.type`. Extra properties are allowed and
/// nested schemas are not recursed into.
pub fn validate_shape(value: &Value, schema: &Value) -> bool {
    let Some(schema) = schema.as_object() else { return true };

    if let Some(Value::Array(required)) = schema.get("required") {
        for field in required {
            let Some(field_name) = field.as_str() else { continue };
            if value.get(field_name).is_none() {
                return false;
            }
        }
    }

    if let Some(Value::Object(properties)) = schema.get("properties") {
        for (name, prop_schema) in properties {
            let Some(actual) = value.get(name) else { continue };
            let Some(Value::String(declared_type)) = prop_schema.get("type") else { continue };
            if !type_matches(actual, declared_type) {
                return false;
            }
        }
    }

    true
}

fn type_matches(value: &Value, declared: &str) -> bool {
    match declared {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}
