//! Declared parameter schemas and coercion.
//!
//! A schema is part of a target's registration, not a user-supplied
//! document. Coercion is deliberately forgiving on representation
//! ("1" parses to 1) and strict on shape: unknown fields and missing
//! required fields fail with the offending field named.

use std::fmt;

use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// ParamType / ParamField / ParamSchema
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Float,
    Boolean,
    /// Any JSON value, passed through untouched.
    Json,
}

impl ParamType {
    fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::Boolean => "boolean",
            ParamType::Json => "json",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParamField {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<Value>,
}

/// Typed parameter contract declared at registration time.
#[derive(Clone, Debug, Default)]
pub struct ParamSchema {
    fields: Vec<ParamField>,
    allow_unknown: bool,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept an empty object and nothing else.
    pub fn empty() -> Self {
        Self::new()
    }

    pub fn required(mut self, name: &str, ty: ParamType) -> Self {
        self.fields.push(ParamField {
            name: name.to_string(),
            ty,
            required: true,
            default: None,
        });
        self
    }

    pub fn optional(mut self, name: &str, ty: ParamType, default: Option<Value>) -> Self {
        self.fields.push(ParamField {
            name: name.to_string(),
            ty,
            required: false,
            default,
        });
        self
    }

    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    pub fn fields(&self) -> &[ParamField] {
        &self.fields
    }

    /// Validate and coerce `params` against this schema, returning the
    /// canonical parameter object handed to the callable.
    pub fn coerce(&self, params: &Value) -> Result<Value, CoercionError> {
        let empty = Map::new();
        let obj = match params {
            Value::Object(m) => m,
            Value::Null => &empty,
            other => {
                return Err(CoercionError {
                    field: "<root>".to_string(),
                    detail: format!("parameters must be an object, got {}", json_kind(other)),
                })
            }
        };

        if !self.allow_unknown {
            for key in obj.keys() {
                if !self.fields.iter().any(|f| &f.name == key) {
                    return Err(CoercionError {
                        field: key.clone(),
                        detail: "unknown parameter".to_string(),
                    });
                }
            }
        }

        let mut out = Map::new();
        for field in &self.fields {
            match obj.get(&field.name) {
                Some(raw) => {
                    let coerced = coerce_value(raw, field.ty).map_err(|detail| CoercionError {
                        field: field.name.clone(),
                        detail,
                    })?;
                    out.insert(field.name.clone(), coerced);
                }
                None if field.required => {
                    return Err(CoercionError {
                        field: field.name.clone(),
                        detail: "required parameter missing".to_string(),
                    });
                }
                None => {
                    if let Some(d) = &field.default {
                        out.insert(field.name.clone(), d.clone());
                    }
                }
            }
        }

        if self.allow_unknown {
            for (k, v) in obj {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        Ok(Value::Object(out))
    }
}

fn coerce_value(raw: &Value, ty: ParamType) -> Result<Value, String> {
    match ty {
        ParamType::Json => Ok(raw.clone()),
        ParamType::String => match raw {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            other => Err(format!("expected string, got {}", json_kind(other))),
        },
        ParamType::Integer => match raw {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(raw.clone()),
            Value::Number(n) => {
                // Accept floats with no fractional part.
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Ok(Value::from(f as i64))
                } else {
                    Err(format!("expected integer, got {}", n))
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("expected integer, got {s:?}")),
            other => Err(format!("expected integer, got {}", json_kind(other))),
        },
        ParamType::Float => match raw {
            Value::Number(n) => {
                let f = n
                    .as_f64()
                    .ok_or_else(|| format!("expected float, got {}", n))?;
                Ok(Value::from(f))
            }
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("expected float, got {s:?}")),
            other => Err(format!("expected float, got {}", json_kind(other))),
        },
        ParamType::Boolean => match raw {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("expected boolean, got {s:?}")),
            },
            other => Err(format!("expected boolean, got {}", json_kind(other))),
        },
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// CoercionError
// ---------------------------------------------------------------------------

/// Coercion failure with the offending field named. Surfaces to the record
/// as `INVALID_PARAMS`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoercionError {
    pub field: String,
    pub detail: String,
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parameter {:?}: {}", self.field, self.detail)
    }
}

impl std::error::Error for CoercionError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_representations_coerce_to_declared_types() {
        let schema = ParamSchema::new()
            .required("count", ParamType::Integer)
            .required("rate", ParamType::Float)
            .required("on", ParamType::Boolean);

        let out = schema
            .coerce(&json!({"count": "3", "rate": "0.5", "on": "true"}))
            .unwrap();
        assert_eq!(out, json!({"count": 3, "rate": 0.5, "on": true}));
    }

    #[test]
    fn missing_required_field_names_the_field() {
        let schema = ParamSchema::new().required("x", ParamType::Integer);
        let err = schema.coerce(&json!({})).unwrap_err();
        assert_eq!(err.field, "x");
        assert!(err.detail.contains("required"));
    }

    #[test]
    fn optional_field_takes_its_default() {
        let schema =
            ParamSchema::new().optional("message", ParamType::String, Some(json!("boom")));
        let out = schema.coerce(&json!({})).unwrap();
        assert_eq!(out, json!({"message": "boom"}));
    }

    #[test]
    fn unknown_field_is_rejected_by_default() {
        let schema = ParamSchema::new().required("x", ParamType::Integer);
        let err = schema.coerce(&json!({"x": 1, "y": 2})).unwrap_err();
        assert_eq!(err.field, "y");
    }

    #[test]
    fn allow_unknown_passes_extras_through() {
        let schema = ParamSchema::new()
            .required("x", ParamType::Integer)
            .allow_unknown();
        let out = schema.coerce(&json!({"x": 1, "y": 2})).unwrap();
        assert_eq!(out, json!({"x": 1, "y": 2}));
    }

    #[test]
    fn non_object_parameters_are_rejected() {
        let schema = ParamSchema::new();
        let err = schema.coerce(&json!([1, 2])).unwrap_err();
        assert_eq!(err.field, "<root>");
    }

    #[test]
    fn null_parameters_mean_empty_object() {
        let schema =
            ParamSchema::new().optional("x", ParamType::Integer, Some(json!(7)));
        let out = schema.coerce(&Value::Null).unwrap();
        assert_eq!(out, json!({"x": 7}));
    }

    #[test]
    fn fractional_float_does_not_coerce_to_integer() {
        let schema = ParamSchema::new().required("x", ParamType::Integer);
        assert!(schema.coerce(&json!({"x": 1.5})).is_err());
        assert_eq!(
            schema.coerce(&json!({"x": 2.0})).unwrap(),
            json!({"x": 2})
        );
    }
}
