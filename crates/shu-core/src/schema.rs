// Minimal JSON-schema checking for plugin inputs and outputs
//
// The contract needs required-key presence, primitive type agreement, and
// enum membership - the subset plugin schemas actually use. Anything the
// checker does not understand passes, so a richer schema never rejects a
// valid instance.

use serde_json::Value;

/// Validate `instance` against `schema`. Returns the first violation.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if instance.get(key).is_none() {
                return Err(format!("'{key}' is a required property"));
            }
        }
    }

    if let Some(expected) = schema_obj.get("type").and_then(Value::as_str) {
        if !type_matches(expected, instance) {
            return Err(format!(
                "expected type '{expected}', got {}",
                type_name(instance)
            ));
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(instance) {
            return Err(format!("{instance} is not one of the allowed values"));
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        for (key, prop_schema) in properties {
            if let Some(prop_value) = instance.get(key) {
                validate(prop_schema, prop_value).map_err(|e| format!("{key}: {e}"))?;
            }
        }
    }

    if let Some(items) = schema_obj.get("items") {
        if let Some(array) = instance.as_array() {
            for (i, item) in array.iter().enumerate() {
                validate(items, item).map_err(|e| format!("[{i}]: {e}"))?;
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
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

    fn op_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "op": {"type": "string", "enum": ["list", "search"]},
                "limit": {"type": "integer"},
            },
            "required": ["op"],
        })
    }

    #[test]
    fn missing_required_key_fails() {
        let err = validate(&op_schema(), &json!({})).unwrap_err();
        assert!(err.contains("'op' is a required property"));
    }

    #[test]
    fn enum_violation_fails() {
        let err = validate(&op_schema(), &json!({"op": "delete"})).unwrap_err();
        assert!(err.contains("allowed values"));
    }

    #[test]
    fn wrong_property_type_fails() {
        let err = validate(&op_schema(), &json!({"op": "list", "limit": "ten"})).unwrap_err();
        assert!(err.starts_with("limit:"));
    }

    #[test]
    fn valid_instance_passes() {
        assert!(validate(&op_schema(), &json!({"op": "list", "limit": 10})).is_ok());
    }

    #[test]
    fn array_items_are_checked() {
        let schema = json!({"type": "array", "items": {"type": "string"}});
        assert!(validate(&schema, &json!(["a", "b"])).is_ok());
        assert!(validate(&schema, &json!(["a", 3])).is_err());
    }

    #[test]
    fn unknown_keywords_pass() {
        let schema = json!({"type": "object", "patternProperties": {"x": {}}});
        assert!(validate(&schema, &json!({"anything": 1})).is_ok());
    }
}
