use super::{DataType, DbError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Column values of one row, keyed by attribute name.
pub type Fields = BTreeMap<String, Value>;

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

/// How a missing attribute is filled on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultValue {
    /// Next value of the table's sequence; assigned by the storage engine.
    AutoIncrement,
    /// Random v4 UUID rendered as text.
    Uuid,
    /// Current UTC timestamp.
    Now,
    Value(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub unique: bool,
    pub default: Option<DefaultValue>,
    pub references: Option<ForeignKey>,
}

impl AttributeSpec {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            unique: false,
            default: None,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn auto_increment(self) -> Self {
        self.not_null().default_value(DefaultValue::AutoIncrement)
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    /// Checks nullability and type of a value destined for this attribute.
    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(DbError::Validation(format!(
                    "Attribute '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(DbError::Validation(format!(
                "Attribute '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

/// Describes one persisted collection: table name, primary key and attributes.
///
/// Built once when an accessor is constructed and never mutated afterwards;
/// share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityModel {
    name: String,
    primary_key: String,
    attributes: Vec<AttributeSpec>,
    timestamps: bool,
}

impl EntityModel {
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            attributes: Vec::new(),
            timestamps: false,
        }
    }

    pub fn attribute(mut self, attribute: AttributeSpec) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Adds managed `created_at` / `updated_at` attributes.
    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        for name in [CREATED_AT, UPDATED_AT] {
            if self.find_attribute(name).is_none() {
                self.attributes.push(
                    AttributeSpec::new(name, DataType::Timestamp)
                        .not_null()
                        .default_value(DefaultValue::Now),
                );
            }
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn attributes(&self) -> &[AttributeSpec] {
        &self.attributes
    }

    pub fn has_timestamps(&self) -> bool {
        self.timestamps
    }

    pub fn find_attribute(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.find_attribute(name).is_some()
    }

    pub fn primary_key_attribute(&self) -> Result<&AttributeSpec> {
        self.find_attribute(&self.primary_key).ok_or_else(|| {
            DbError::Validation(format!(
                "Primary key '{}' is not an attribute of '{}'",
                self.primary_key, self.name
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DbError::Validation("Model name cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for attr in &self.attributes {
            if attr.name.trim().is_empty() {
                return Err(DbError::Validation(format!(
                    "Model '{}' has an attribute with an empty name",
                    self.name
                )));
            }
            if !seen.insert(attr.name.as_str()) {
                return Err(DbError::Validation(format!(
                    "Model '{}' declares attribute '{}' twice",
                    self.name, attr.name
                )));
            }
        }

        self.primary_key_attribute()?;

        if self.timestamps && !(self.has_attribute(CREATED_AT) && self.has_attribute(UPDATED_AT)) {
            return Err(DbError::Validation(format!(
                "Model '{}' enables timestamps without timestamp attributes",
                self.name
            )));
        }

        Ok(())
    }

    /// Rejects attribute names that are not part of this model.
    pub fn ensure_known(&self, field: &str) -> Result<()> {
        if self.has_attribute(field) {
            Ok(())
        } else {
            Err(DbError::Validation(format!(
                "Unknown attribute '{}' for '{}'",
                field, self.name
            )))
        }
    }
}

/// A row returned by an accessor, with eager-loaded associations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    values: Fields,
    associations: BTreeMap<String, Vec<Record>>,
}

impl Record {
    pub fn new(values: Fields) -> Self {
        Self {
            values,
            associations: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn values(&self) -> &Fields {
        &self.values
    }

    pub fn into_values(self) -> Fields {
        self.values
    }

    pub fn association(&self, name: &str) -> Option<&[Record]> {
        self.associations.get(name).map(Vec::as_slice)
    }

    pub(crate) fn attach(&mut self, name: &str, records: Vec<Record>) {
        self.associations.insert(name.to_string(), records);
    }
}

/// Builds a [`Fields`] map from `name => value` pairs.
///
/// ```
/// use feedback_dal::fields;
/// let attrs = fields! { "title" => "Slow page", "votes" => 3i64 };
/// assert_eq!(attrs.len(), 2);
/// ```
#[macro_export]
macro_rules! fields {
    () => { $crate::core::Fields::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::core::Fields::new();
        $( map.insert(($name).to_string(), $crate::core::Value::from($value)); )+
        map
    }};
}
