use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::{ToolError, ToolResult};

/// JSON type of a tool argument
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub description: String,
    pub field_type: FieldType,
    pub required: bool,
}

/// Structural contract of a tool's arguments
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputSchema {
    fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, name: &str, field_type: FieldType, description: &str) -> Self {
        self.field(name, field_type, description, true)
    }

    pub fn optional(self, name: &str, field_type: FieldType, description: &str) -> Self {
        self.field(name, field_type, description, false)
    }

    fn field(mut self, name: &str, field_type: FieldType, description: &str, required: bool) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            description: description.to_string(),
            field_type,
            required,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Field names must be non-empty and unique
    pub(crate) fn check(&self) -> Result<(), String> {
        for (i, f) in self.fields.iter().enumerate() {
            if f.name.trim().is_empty() {
                return Err("field with empty name".into());
            }
            if self.fields[..i].iter().any(|g| g.name == f.name) {
                return Err(format!("field '{}' declared twice", f.name));
            }
        }
        Ok(())
    }

    /// Arguments must be an object carrying every required field with the declared type.
    /// Unknown fields are tolerated.
    pub fn validate(&self, tool: &str, arguments: &Value) -> ToolResult<()> {
        let invalid = |reason: String| ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason,
        };

        let args = arguments
            .as_object()
            .ok_or_else(|| invalid(format!("expected an object, got {arguments}")))?;

        for field in &self.fields {
            match args.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(invalid(format!("missing required field '{}'", field.name)));
                }
                Some(v) if !v.is_null() && !field.field_type.matches(v) => {
                    return Err(invalid(format!(
                        "field '{}' must be {}",
                        field.name,
                        field.field_type.as_str()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// JSON Schema form sent to the model
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for f in &self.fields {
            properties.insert(
                f.name.clone(),
                json!({"type": f.field_type.as_str(), "description": f.description}),
            );
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// A tool as advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, input_schema: InputSchema) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }

    pub fn to_wire(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema.to_json_schema(),
        })
    }
}
