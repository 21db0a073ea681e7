use crate::core::error::NOT_NULL_VIOLATION;
use crate::core::{DbError, DefaultValue, EntityModel, Fields, Result, Value};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Committed image of one row. `version` is the commit that last wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub values: Fields,
    pub version: u64,
}

/// Committed rows of one collection, keyed by primary key.
#[derive(Debug, Clone)]
pub struct Table {
    model: Arc<EntityModel>,
    rows: BTreeMap<Value, StoredRow>,
    sequence: i64,
}

impl Table {
    pub fn new(model: Arc<EntityModel>) -> Self {
        Self {
            model,
            rows: BTreeMap::new(),
            sequence: 0,
        }
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&StoredRow> {
        self.rows.get(key)
    }

    pub fn version_of(&self, key: &Value) -> Option<u64> {
        self.rows.get(key).map(|row| row.version)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&Value, &StoredRow)> {
        self.rows.iter()
    }

    pub fn put(&mut self, key: Value, values: Fields, version: u64) {
        self.rows.insert(key, StoredRow { values, version });
    }

    pub fn remove(&mut self, key: &Value) -> Option<StoredRow> {
        self.rows.remove(key)
    }

    /// Next value for `AutoIncrement` attributes. Sequences are not transactional:
    /// values handed out to rolled-back inserts are never reused.
    pub fn next_sequence(&mut self) -> i64 {
        self.sequence += 1;
        self.sequence
    }

    /// Keeps the sequence ahead of explicitly supplied integer keys.
    pub fn observe_sequence(&mut self, value: i64) {
        if value > self.sequence {
            self.sequence = value;
        }
    }

    /// Fills engine-side defaults and shapes an incoming row to the model.
    ///
    /// `AutoIncrement` values must already be assigned. Missing nullable
    /// attributes become `NULL`; missing required ones raise a not-null violation.
    pub fn prepare_insert(&self, mut values: Fields) -> Result<Fields> {
        for attr in self.model.attributes() {
            let missing = values.get(&attr.name).is_none_or(Value::is_null);
            if !missing {
                continue;
            }
            let filled = match &attr.default {
                Some(DefaultValue::Uuid) => Value::Text(Uuid::new_v4().to_string()),
                Some(DefaultValue::Now) => Value::Timestamp(Utc::now()),
                Some(DefaultValue::Value(v)) => v.clone(),
                Some(DefaultValue::AutoIncrement) | None => Value::Null,
            };
            values.insert(attr.name.clone(), filled);
        }
        self.normalize(values)
    }

    /// Rejects unknown columns, checks types and nullability.
    pub fn normalize(&self, values: Fields) -> Result<Fields> {
        if let Some(unknown) = values.keys().find(|k| !self.model.has_attribute(k)) {
            return Err(DbError::from_sqlstate(
                "42703",
                format!("column '{}' of '{}' does not exist", unknown, self.name()),
            ));
        }

        for attr in self.model.attributes() {
            let value = values.get(&attr.name).unwrap_or(&Value::Null);
            if value.is_null() && !attr.nullable {
                return Err(DbError::constraint(
                    NOT_NULL_VIOLATION,
                    format!(
                        "null value in column '{}' of '{}' violates not-null constraint",
                        attr.name,
                        self.name()
                    ),
                ));
            }
            if !attr.data_type.is_compatible(value) {
                return Err(DbError::Validation(format!(
                    "Attribute '{}' expects type {}, got {}",
                    attr.name,
                    attr.data_type,
                    value.type_name()
                )));
            }
        }

        let mut shaped = values;
        for attr in self.model.attributes() {
            shaped.entry(attr.name.clone()).or_insert(Value::Null);
        }
        Ok(shaped)
    }
}
