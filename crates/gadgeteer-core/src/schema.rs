//! Parameter schema descriptor for gadgets.
//!
//! Schemas are a closed sum type rather than free-form JSON Schema: every
//! shape a gadget can accept is expressible here, and open-ended `any`
//! parameters cannot be declared at all. A JSON-Schema view is generated
//! for LLM prompts; a validator checks incoming parameter values.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// A field of an object schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub schema: ParamSchema,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, schema: ParamSchema) -> Self {
        Self {
            name: name.into(),
            schema,
            description: None,
        }
    }

    pub fn described(name: impl Into<String>, schema: ParamSchema, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema,
            description: Some(description.into()),
        }
    }
}

/// Parameter schema sum type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamSchema {
    String,
    Integer,
    Number,
    Boolean,
    Enum { variants: Vec<String> },
    Object { fields: Vec<Field> },
    Array { elem: Box<ParamSchema> },
    Optional { inner: Box<ParamSchema> },
}

/// Schema registration failure.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("enum schema must declare at least one variant")]
    EmptyEnum,

    #[error("object field '{0}' declared more than once")]
    DuplicateField(String),

    #[error("optional schema cannot wrap another optional")]
    NestedOptional,
}

/// A single validation failure, path-qualified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldViolation {
    /// Slash-separated path to the offending value ("" for the root).
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

impl ParamSchema {
    pub fn object(fields: Vec<Field>) -> Self {
        Self::Object { fields }
    }

    pub fn array(elem: ParamSchema) -> Self {
        Self::Array { elem: Box::new(elem) }
    }

    pub fn optional(inner: ParamSchema) -> Self {
        Self::Optional { inner: Box::new(inner) }
    }

    pub fn enumeration(variants: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Enum {
            variants: variants.into_iter().map(Into::into).collect(),
        }
    }

    /// Check the schema is well-formed. Run once at registration.
    pub fn check(&self) -> Result<(), SchemaError> {
        match self {
            Self::String | Self::Integer | Self::Number | Self::Boolean => Ok(()),
            Self::Enum { variants } => {
                if variants.is_empty() {
                    Err(SchemaError::EmptyEnum)
                } else {
                    Ok(())
                }
            }
            Self::Object { fields } => {
                let mut seen = std::collections::HashSet::new();
                for field in fields {
                    if !seen.insert(field.name.as_str()) {
                        return Err(SchemaError::DuplicateField(field.name.clone()));
                    }
                    field.schema.check()?;
                }
                Ok(())
            }
            Self::Array { elem } => elem.check(),
            Self::Optional { inner } => {
                if matches!(inner.as_ref(), Self::Optional { .. }) {
                    Err(SchemaError::NestedOptional)
                } else {
                    inner.check()
                }
            }
        }
    }

    /// JSON-Schema view for LLM prompts.
    pub fn to_json_schema(&self) -> Value {
        match self {
            Self::String => json!({"type": "string"}),
            Self::Integer => json!({"type": "integer"}),
            Self::Number => json!({"type": "number"}),
            Self::Boolean => json!({"type": "boolean"}),
            Self::Enum { variants } => json!({"type": "string", "enum": variants}),
            Self::Object { fields } => {
                let mut properties = serde_json::Map::new();
                let mut required = Vec::new();
                for field in fields {
                    let mut prop = field.schema.unwrap_optional().to_json_schema();
                    if let (Some(desc), Some(obj)) = (&field.description, prop.as_object_mut()) {
                        obj.insert("description".into(), json!(desc));
                    }
                    properties.insert(field.name.clone(), prop);
                    if !matches!(field.schema, Self::Optional { .. }) {
                        required.push(field.name.clone());
                    }
                }
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                })
            }
            Self::Array { elem } => json!({"type": "array", "items": elem.to_json_schema()}),
            Self::Optional { inner } => inner.to_json_schema(),
        }
    }

    fn unwrap_optional(&self) -> &ParamSchema {
        match self {
            Self::Optional { inner } => inner,
            other => other,
        }
    }

    /// Validate a parameter value, collecting every violation.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<FieldViolation>> {
        let mut violations = Vec::new();
        self.validate_at("", value, &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn validate_at(&self, path: &str, value: &Value, out: &mut Vec<FieldViolation>) {
        let violation = |message: String| FieldViolation {
            path: path.to_string(),
            message,
        };
        match self {
            Self::String => {
                if !value.is_string() {
                    out.push(violation(format!("expected string, got {}", type_name(value))));
                }
            }
            Self::Integer => {
                if !value.is_i64() && !value.is_u64() {
                    out.push(violation(format!("expected integer, got {}", type_name(value))));
                }
            }
            Self::Number => {
                if !value.is_number() {
                    out.push(violation(format!("expected number, got {}", type_name(value))));
                }
            }
            Self::Boolean => {
                if !value.is_boolean() {
                    out.push(violation(format!("expected boolean, got {}", type_name(value))));
                }
            }
            Self::Enum { variants } => match value.as_str() {
                Some(s) if variants.iter().any(|v| v == s) => {}
                Some(s) => out.push(violation(format!(
                    "'{}' is not one of [{}]",
                    s,
                    variants.join(", ")
                ))),
                None => out.push(violation(format!("expected string, got {}", type_name(value)))),
            },
            Self::Object { fields } => {
                let Some(map) = value.as_object() else {
                    out.push(violation(format!("expected object, got {}", type_name(value))));
                    return;
                };
                for field in fields {
                    let child_path = if path.is_empty() {
                        field.name.clone()
                    } else {
                        format!("{}/{}", path, field.name)
                    };
                    match map.get(&field.name) {
                        Some(v) => field.schema.validate_at(&child_path, v, out),
                        None => {
                            if !matches!(field.schema, Self::Optional { .. }) {
                                out.push(FieldViolation {
                                    path: child_path,
                                    message: "required field is missing".into(),
                                });
                            }
                        }
                    }
                }
                for key in map.keys() {
                    if !fields.iter().any(|f| &f.name == key) {
                        out.push(FieldViolation {
                            path: if path.is_empty() {
                                key.clone()
                            } else {
                                format!("{}/{}", path, key)
                            },
                            message: "unknown field".into(),
                        });
                    }
                }
            }
            Self::Array { elem } => {
                let Some(items) = value.as_array() else {
                    out.push(violation(format!("expected array, got {}", type_name(value))));
                    return;
                };
                for (i, item) in items.iter().enumerate() {
                    let child_path = if path.is_empty() {
                        i.to_string()
                    } else {
                        format!("{}/{}", path, i)
                    };
                    elem.validate_at(&child_path, item, out);
                }
            }
            Self::Optional { inner } => {
                if !value.is_null() {
                    inner.validate_at(path, value, out);
                }
            }
        }
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
