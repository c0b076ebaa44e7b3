//! Collection schemas: validation, sort order and join semantics.
//!
//! One [`CollectionSchema`] per collection kind replaces per-feature sync
//! code. It validates drafts before any optimistic apply, decides where an
//! entity sits in the mirror, and marks join collections (favorites,
//! reactions) whose markers are unique per `(target, user)`.

use crate::{error::Result, CollectionKind, Entity, Error, Mutation, SchemaVersion};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Sort direction of a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

/// The stable sort key of a mirror: one field plus a direction, ties
/// broken by entity id so the order is total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortOrder {
    pub field: String,
    pub direction: Direction,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            field: "createdAt".into(),
            direction: Direction::Desc,
        }
    }
}

impl SortOrder {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }

    /// Compare two entities in mirror order.
    pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        let primary = compare_values(a.field(&self.field).as_ref(), b.field(&self.field).as_ref());
        let primary = match self.direction {
            Direction::Asc => primary,
            Direction::Desc => primary.reverse(),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

/// Total order over optional JSON values: missing < null < bool < number
/// < string < array < object.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x @ Value::Array(_)), Some(y @ Value::Array(_)))
        | (Some(x @ Value::Object(_)), Some(y @ Value::Object(_))) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Schema for one collection kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection kind
    pub kind: CollectionKind,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Mirror ordering
    #[serde(default)]
    pub sort: SortOrder,
    /// Payload field naming the target of a marker (join collections only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_field: Option<String>,
}

impl CollectionSchema {
    /// Create a new collection schema sorted by creation time, newest first.
    pub fn new(kind: impl Into<CollectionKind>, fields: Vec<FieldDef>) -> Self {
        Self {
            kind: kind.into(),
            fields,
            sort: SortOrder::default(),
            join_field: None,
        }
    }

    /// Builder-style method to set the sort order.
    pub fn sorted_by(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Declare this a join collection whose markers point at `field`.
    ///
    /// The target field becomes required.
    pub fn joined_on(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.fields.iter().any(|f| f.name == field) {
            self.fields
                .push(FieldDef::required(field.clone(), FieldType::String));
        }
        self.join_field = Some(field);
        self
    }

    /// Validate a full payload against this schema.
    pub fn validate_payload(&self, payload: &Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Validate a partial update: only the fields present are checked.
    pub fn validate_patch(&self, patch: &Map<String, Value>) -> Result<()> {
        if patch.is_empty() {
            return Err(Error::InvalidPayload("patch must not be empty".into()));
        }
        for field in &self.fields {
            if let Some(value) = patch.get(&field.name) {
                field.validate(Some(value))?;
            }
        }
        Ok(())
    }
}

/// Schema for every collection a session may synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version
    pub version: SchemaVersion,
    /// Collection schemas by kind
    pub collections: HashMap<CollectionKind, CollectionSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: HashMap::new(),
        }
    }

    /// Add a collection to the schema.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.kind.clone(), collection);
        self
    }

    /// Builder-style method to add a collection.
    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    /// Builder-style method to add a typed collection.
    pub fn with_kind<K: EntityKind>(self) -> Self {
        self.with_collection(K::schema())
    }

    /// Get a collection schema by kind.
    pub fn get_collection(&self, kind: &str) -> Option<&CollectionSchema> {
        self.collections.get(kind)
    }

    /// Get a collection schema or fail with `CollectionNotFound`.
    pub fn collection(&self, kind: &str) -> Result<&CollectionSchema> {
        self.collections
            .get(kind)
            .ok_or_else(|| Error::CollectionNotFound(kind.to_string()))
    }

    /// Validate a mutation against a collection before it is applied.
    pub fn validate_mutation(&self, kind: &str, mutation: &Mutation) -> Result<()> {
        let collection = self.collection(kind)?;

        match mutation {
            Mutation::Create { payload } => collection.validate_payload(payload),
            Mutation::Update { id, patch } => {
                if id.is_empty() {
                    return Err(Error::InvalidPayload("entity id must not be empty".into()));
                }
                if let Some(join_field) = &collection.join_field {
                    if patch.contains_key(join_field) {
                        return Err(Error::InvalidPayload(format!(
                            "join field '{join_field}' cannot be patched"
                        )));
                    }
                }
                collection.validate_patch(patch)
            }
            Mutation::Delete { id } => {
                if id.is_empty() {
                    return Err(Error::InvalidPayload("entity id must not be empty".into()));
                }
                Ok(())
            }
            Mutation::Toggle { target_id, .. } => {
                if collection.join_field.is_none() {
                    return Err(Error::NotToggleable(kind.to_string()));
                }
                if target_id.is_empty() {
                    return Err(Error::InvalidPayload("target id must not be empty".into()));
                }
                Ok(())
            }
        }
    }
}

/// A typed collection: the serialize/deserialize/sort-key capability set
/// for one record type.
pub trait EntityKind: Serialize + DeserializeOwned {
    /// Collection kind discriminator
    const KIND: &'static str;

    /// Schema used for validation and ordering.
    fn schema() -> CollectionSchema {
        CollectionSchema::new(Self::KIND, Vec::new())
    }

    /// Encode into an entity payload.
    fn to_payload(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    /// Decode from an entity of this kind.
    fn from_entity(entity: &Entity) -> Result<Self> {
        if entity.kind != Self::KIND {
            return Err(Error::ForeignEntity {
                id: entity.id.clone(),
                expected: Self::KIND.to_string(),
            });
        }
        entity.decode()
    }
}
