//! Invoke-argument validation against cached input schemas.
//!
//! Only type, required-field, and enum checks are performed — a full JSON
//! Schema validator would reject payloads the downstream itself accepts.
//! Unknown extra fields pass through untouched. The single permitted
//! coercion is a numeric string against a numeric type, parsed explicitly;
//! everything else must already be the declared JSON type.

use serde_json::Value;

use crate::error::GatewayError;

/// Validates `arguments` against `schema`, coercing numeric strings in
/// place.
///
/// # Errors
///
/// Returns `InvalidArgument` naming the first offending field.
pub fn validate_arguments(schema: &Value, arguments: &mut Value) -> Result<(), GatewayError> {
    // A downstream that declares no schema accepts anything
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };
    if schema_obj.is_empty() {
        return Ok(());
    }

    if !arguments.is_object() {
        return Err(GatewayError::InvalidArgument {
            message: "arguments must be a JSON object".to_string(),
        });
    }

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if arguments.get(field).is_none() {
                return Err(GatewayError::InvalidArgument {
                    message: format!("missing required field '{field}'"),
                });
            }
        }
    }

    let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    let args_obj = arguments
        .as_object_mut()
        .ok_or_else(|| GatewayError::InvalidArgument {
            message: "arguments must be a JSON object".to_string(),
        })?;

    for (field, prop_schema) in properties {
        let Some(value) = args_obj.get_mut(field) else {
            continue;
        };
        if let Some(declared) = prop_schema.get("type").and_then(Value::as_str) {
            coerce_numeric_string(declared, value);
            if !type_matches(declared, value) {
                return Err(GatewayError::InvalidArgument {
                    message: format!(
                        "field '{field}' must be of type {declared}, got {}",
                        type_name(value)
                    ),
                });
            }
        }
        if let Some(allowed) = prop_schema.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(GatewayError::InvalidArgument {
                    message: format!("field '{field}' is not one of the allowed values"),
                });
            }
        }
    }

    Ok(())
}

/// Replaces a numeric string with its parsed number when the schema asks
/// for one.
fn coerce_numeric_string(declared: &str, value: &mut Value) {
    let Some(text) = value.as_str() else {
        return;
    };
    match declared {
        "integer" => {
            if let Ok(n) = text.trim().parse::<i64>() {
                *value = Value::from(n);
            }
        }
        "number" => {
            if let Ok(n) = text.trim().parse::<f64>() {
                if let Some(number) = serde_json::Number::from_f64(n) {
                    *value = Value::Number(number);
                }
            }
        }
        _ => {}
    }
}

fn type_matches(declared: &str, value: &Value) -> bool {
    match declared {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unrecognised declarations pass; the downstream owns them
        _ => true,
    }
}

const fn type_name(value: &Value) -> &'static str {
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
    use serde_json::json;

    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "count": {"type": "integer"},
                "ratio": {"type": "number"},
                "deep": {"type": "boolean"},
                "mode": {"type": "string", "enum": ["fast", "slow"]}
            },
            "required": ["name"]
        })
    }

    #[test]
    fn valid_arguments_pass() {
        let mut args = json!({"name": "world", "count": 3, "mode": "fast"});
        validate_arguments(&schema(), &mut args).unwrap();
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut args = json!({"count": 3});
        let err = validate_arguments(&schema(), &mut args).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut args = json!({"name": 42});
        let err = validate_arguments(&schema(), &mut args).unwrap_err();
        assert!(err.to_string().contains("string"));
    }

    #[test]
    fn numeric_string_is_parsed_for_integer() {
        let mut args = json!({"name": "x", "count": "17"});
        validate_arguments(&schema(), &mut args).unwrap();
        assert_eq!(args["count"], json!(17));
    }

    #[test]
    fn numeric_string_is_parsed_for_number() {
        let mut args = json!({"name": "x", "ratio": "0.5"});
        validate_arguments(&schema(), &mut args).unwrap();
        assert!((args["ratio"].as_f64().unwrap() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn non_numeric_string_against_integer_is_rejected() {
        let mut args = json!({"name": "x", "count": "many"});
        let err = validate_arguments(&schema(), &mut args).unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn boolean_string_is_not_coerced() {
        // Only numeric strings are coerced; "true" stays a string
        let mut args = json!({"name": "x", "deep": "true"});
        let err = validate_arguments(&schema(), &mut args).unwrap_err();
        assert!(err.to_string().contains("deep"));
    }

    #[test]
    fn enum_violation_is_rejected() {
        let mut args = json!({"name": "x", "mode": "medium"});
        let err = validate_arguments(&schema(), &mut args).unwrap_err();
        assert!(err.to_string().contains("mode"));
    }

    #[test]
    fn unknown_extra_fields_pass_through() {
        let mut args = json!({"name": "x", "undeclared": {"anything": true}});
        validate_arguments(&schema(), &mut args).unwrap();
        assert!(args.get("undeclared").is_some());
    }

    #[test]
    fn empty_schema_accepts_anything() {
        let mut args = json!({"whatever": 1});
        validate_arguments(&json!({}), &mut args).unwrap();
        validate_arguments(&Value::Null, &mut args).unwrap();
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        let mut args = json!([1, 2, 3]);
        let err = validate_arguments(&schema(), &mut args).unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }
}
