//! Field-list schemas for task and workflow input/output.

use serde_json::Value;
use std::fmt;

/// Kind of value a schema field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A JSON string.
    Text,
    /// A JSON number.
    Number,
    /// A JSON boolean.
    Checkbox,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
    /// Any JSON value.
    Json,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::Text => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Checkbox => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Json => true,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Json => "json",
        };
        f.write_str(name)
    }
}

/// One named field of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Property name in the JSON object.
    pub name: String,
    /// Accepted value kind.
    pub kind: FieldKind,
    /// Whether the field must be present and non-null.
    pub required: bool,
}

/// Declared shape of a task or workflow payload.
///
/// An empty schema accepts any value. A non-empty schema requires a JSON
/// object whose required fields are present and whose present fields have
/// the declared kind. Unknown properties are accepted.
///
/// # Examples
///
/// ```
/// use tsuzuki_core::{FieldKind, Schema};
/// use serde_json::json;
///
/// let schema = Schema::new()
///     .required("title", FieldKind::Text)
///     .optional("draft", FieldKind::Checkbox);
///
/// assert!(schema.validate(&json!({ "title": "Hello" })).is_ok());
/// assert!(schema.validate(&json!({ "draft": true })).is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

/// Violations found while validating a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", .violations.join("; "))]
pub struct SchemaError {
    /// One message per violated rule.
    pub violations: Vec<String>,
}

impl Schema {
    /// Creates an empty schema that accepts anything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field.
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Adds an optional field.
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Returns the declared fields.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Returns `true` if the schema declares no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validates `value` against the schema.
    ///
    /// # Errors
    ///
    /// Returns every violation found, not only the first.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let Some(object) = value.as_object() else {
            return Err(SchemaError {
                violations: vec![format!("expected an object, got {}", json_type(value))],
            });
        };

        let violations: Vec<String> = self
            .fields
            .iter()
            .filter_map(|field| match object.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    Some(format!("missing required field '{}'", field.name))
                }
                None | Some(Value::Null) => None,
                Some(v) if !field.kind.accepts(v) => Some(format!(
                    "field '{}' must be {}, got {}",
                    field.name,
                    field.kind,
                    json_type(v)
                )),
                Some(_) => None,
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaError { violations })
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
