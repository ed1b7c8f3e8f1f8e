//! Schema support.
//!
//! The OCR service constrains its annotation output using strict JSON
//! Schemas. We describe those schemas declaratively as a list of
//! [`FieldSpec`]s, and build them using one of two [`SchemaStrategy`]s.
//!
//! Whichever strategy is used, every object in the output schema has
//! `additionalProperties` set to `false`. The service relies on this to
//! constrain the model, and an open nested object lets the model emit extra
//! fields that nothing downstream expects.

use std::{collections::HashSet, error, fmt};

use clap::ValueEnum;
use jsonschema::Validator;

use crate::prelude::*;

/// A single named field in a schema.
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FieldSpec {
    /// The name of this field. Must be unique within its schema.
    pub name: String,

    /// A natural-language hint for the annotation model.
    pub description: String,

    /// Must this field be present?
    #[serde(default = "default_required")]
    pub required: bool,

    /// The semantic type of this field.
    #[serde(flatten)]
    pub field_type: FieldType,
}

/// Fields are required unless stated otherwise.
fn default_required() -> bool {
    true
}

/// The semantic types we support.
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    /// A string.
    String,

    /// One of a closed set of string literals.
    Enum {
        /// The allowed values.
        values: Vec<String>,
    },

    /// A list of strings.
    StringList,

    /// A list of structured records.
    RecordList {
        /// The fields of each record.
        fields: Vec<FieldSpec>,
    },
}

/// How should we derive output schemas from field specifications?
///
/// Both strategies produce schemas which accept and reject exactly the same
/// instances. `Direct` emits a closed schema in one pass. `Manual` emits the
/// kind of loose schema a typical schema generator would (nested records
/// moved to `$defs` and referenced by `$ref`), and then walks the tree to
/// close every object.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum SchemaStrategy {
    /// Build closed objects directly from the field specification.
    #[default]
    Direct,

    /// Generate a plain schema and then force every object closed.
    Manual,
}

/// A strict, named JSON Schema ready to send to the OCR service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSchema {
    /// The schema name, as reported to the service.
    pub name: String,

    /// The JSON Schema itself.
    pub schema: Value,
}

impl OutputSchema {
    /// The `response_format`-style wrapper expected by the OCR service.
    pub fn to_response_format(&self) -> Value {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": self.name,
                "schema": self.schema,
                "strict": true,
            },
        })
    }

    /// Compile a validator for this schema.
    pub fn validator(&self) -> Result<Validator> {
        jsonschema::validator_for(&self.schema)
            .map_err(|err| anyhow!("{}", err))
            .with_context(|| format!("failed to compile schema {:?}", self.name))
    }
}

/// Errors in a field specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The schema name was empty.
    EmptySchemaName,

    /// A schema (or nested record) had no fields.
    EmptyFieldSet { schema: String },

    /// Two fields in the same object had the same name.
    DuplicateField { schema: String, field: String },

    /// An enum field had no values.
    EmptyEnum { field: String },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::EmptySchemaName => write!(f, "schema name must not be empty"),
            SchemaError::EmptyFieldSet { schema } => {
                write!(f, "schema {schema:?} must have at least one field")
            }
            SchemaError::DuplicateField { schema, field } => {
                write!(f, "schema {schema:?} defines field {field:?} more than once")
            }
            SchemaError::EmptyEnum { field } => {
                write!(f, "enum field {field:?} must list at least one value")
            }
        }
    }
}

impl error::Error for SchemaError {}

/// Build an output schema named `schema_name` from `fields`.
pub fn build_schema(
    fields: &[FieldSpec],
    schema_name: &str,
    strategy: SchemaStrategy,
) -> Result<OutputSchema, SchemaError> {
    if schema_name.is_empty() {
        return Err(SchemaError::EmptySchemaName);
    }
    check_fields(schema_name, fields)?;

    let schema = match strategy {
        SchemaStrategy::Direct => {
            let mut schema = closed_object(fields);
            schema["title"] = Value::String(schema_name.to_owned());
            schema
        }
        SchemaStrategy::Manual => {
            let mut schema = loose_schema(schema_name, fields);
            close_objects(&mut schema);
            schema
        }
    };
    Ok(OutputSchema {
        name: schema_name.to_owned(),
        schema,
    })
}

/// Check that a field list is non-empty, has unique names, and that nested
/// records and enums are well-formed.
fn check_fields(schema: &str, fields: &[FieldSpec]) -> Result<(), SchemaError> {
    if fields.is_empty() {
        return Err(SchemaError::EmptyFieldSet {
            schema: schema.to_owned(),
        });
    }
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateField {
                schema: schema.to_owned(),
                field: field.name.clone(),
            });
        }
        match &field.field_type {
            FieldType::Enum { values } if values.is_empty() => {
                return Err(SchemaError::EmptyEnum {
                    field: field.name.clone(),
                });
            }
            FieldType::RecordList { fields: nested } => {
                check_fields(&format!("{schema}.{}", field.name), nested)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Names of the required fields, in declaration order.
fn required_names(fields: &[FieldSpec]) -> Vec<Value> {
    fields
        .iter()
        .filter(|f| f.required)
        .map(|f| Value::String(f.name.clone()))
        .collect()
}

/// Schema for a single field. Record items are produced by `record_items`,
/// which is where the two strategies differ.
fn field_schema(
    field: &FieldSpec,
    record_items: impl FnOnce(&[FieldSpec]) -> Value,
) -> Value {
    let mut schema = match &field.field_type {
        FieldType::String => json!({ "type": "string" }),
        FieldType::Enum { values } => json!({ "type": "string", "enum": values }),
        FieldType::StringList => json!({ "type": "array", "items": { "type": "string" } }),
        FieldType::RecordList { fields } => {
            json!({ "type": "array", "items": record_items(fields) })
        }
    };
    schema["description"] = Value::String(field.description.clone());
    schema
}

/// [`SchemaStrategy::Direct`]: a closed object, with nested records inlined.
fn closed_object(fields: &[FieldSpec]) -> Value {
    let mut properties = JsonObject::new();
    for field in fields {
        properties.insert(field.name.clone(), field_schema(field, closed_object));
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required_names(fields),
        "additionalProperties": false,
    })
}

/// [`SchemaStrategy::Manual`], step 1: a schema with no closure flags at all,
/// with every nested record type hoisted into `$defs`.
fn loose_schema(schema_name: &str, fields: &[FieldSpec]) -> Value {
    let mut defs = JsonObject::new();
    let mut schema = loose_object(schema_name, fields, &mut defs);
    if !defs.is_empty() {
        schema["$defs"] = Value::Object(defs);
    }
    schema
}

fn loose_object(title: &str, fields: &[FieldSpec], defs: &mut JsonObject) -> Value {
    let mut properties = JsonObject::new();
    for field in fields {
        let schema = field_schema(field, |nested| {
            let def_name = unique_def_name(&field.name, defs);
            // Reserve the name before recursing, so nested records can't
            // claim it.
            defs.insert(def_name.clone(), Value::Null);
            let record = loose_object(&def_name, nested, defs);
            defs.insert(def_name.clone(), record);
            json!({ "$ref": format!("#/$defs/{def_name}") })
        });
        properties.insert(field.name.clone(), schema);
    }
    json!({
        "title": title,
        "type": "object",
        "properties": properties,
        "required": required_names(fields),
    })
}

/// Pick a `PascalCase` definition name for a record field, avoiding names
/// already in use.
fn unique_def_name(field_name: &str, defs: &JsonObject) -> String {
    let base = field_name
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<String>();
    let base = if base.is_empty() {
        "Record".to_owned()
    } else {
        base
    };
    let mut name = base.clone();
    let mut counter = 2;
    while defs.contains_key(&name) {
        name = format!("{base}{counter}");
        counter += 1;
    }
    name
}

/// [`SchemaStrategy::Manual`], step 2: set `additionalProperties` to `false`
/// on every object schema, at any depth.
pub fn close_objects(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("object") {
                map.insert("additionalProperties".to_owned(), Value::Bool(false));
            }
            for value in map.values_mut() {
                close_objects(value);
            }
        }
        Value::Array(values) => {
            for value in values {
                close_objects(value);
            }
        }
        _ => {}
    }
}
