//! Structural validation of write payloads.
//!
//! A [`Schema`] is optional. When one is configured, every create and update
//! is checked before it touches the cache or the queue, and a failing write is
//! rejected synchronously with a validation [`Error`].

use crate::{error::Result, remote::is_server_timestamp, Error, OperationKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since epoch, or the server timestamp sentinel
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    /// Name used in type mismatch reports.
    pub fn name(self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }

    /// Whether a non-null `value` is of this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || is_server_timestamp(value),
            FieldType::Json => true,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One field of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Creates must carry the field and updates must not null it out
    pub required: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
        }
    }

    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, field_type, true)
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, field_type, false)
    }

    /// Check the value a payload carries for this field. `None` means the
    /// payload leaves the field out, which only a create must not do.
    fn check(&self, value: Option<&Value>, full_document: bool) -> Result<()> {
        let missing = || Error::MissingRequiredField(self.name.clone());
        match value {
            None if self.required && full_document => Err(missing()),
            Some(Value::Null) if self.required => Err(missing()),
            None | Some(Value::Null) => Ok(()),
            Some(value) if self.field_type.accepts(value) => Ok(()),
            Some(value) => Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: value_kind(value).to_string(),
            }),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_f64() => "Float",
        Value::Number(_) => "Int",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Fields of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Last segment of the collection path, e.g. `inv`
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Validate a full document, as written by a create.
    pub fn validate_document(&self, data: &Map<String, Value>) -> Result<()> {
        self.fields
            .iter()
            .try_for_each(|field| field.check(data.get(&field.name), true))
    }

    /// Validate the fields carried by an update.
    ///
    /// Absent required fields are fine; present ones must type-check and
    /// must not be nulled out.
    pub fn validate_fields(&self, data: &Map<String, Value>) -> Result<()> {
        self.fields
            .iter()
            .try_for_each(|field| field.check(data.get(&field.name), false))
    }
}

/// Schemas for the collections the application writes to, keyed by the last
/// segment of the collection path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub collections: HashMap<String, CollectionSchema>,
    /// Reject writes to collections without a schema
    pub strict: bool,
}

impl Schema {
    /// Create an empty, non-strict schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collection, replacing any schema with the same name.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Reject writes to unknown collections.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Validate a write of `kind` to a collection named `collection`.
    pub fn validate_write(
        &self,
        kind: OperationKind,
        collection: &str,
        data: Option<&Map<String, Value>>,
    ) -> Result<()> {
        let Some(collection_schema) = self.collection(collection) else {
            if self.strict {
                return Err(Error::CollectionNotFound(collection.to_string()));
            }
            return Ok(());
        };

        match (kind, data) {
            (OperationKind::Delete, _) => Ok(()),
            (OperationKind::Create, Some(data)) => collection_schema.validate_document(data),
            (OperationKind::Update, Some(data)) => collection_schema.validate_fields(data),
            (_, None) => Err(Error::InvalidPayload("payload must be an object".into())),
        }
    }
}
