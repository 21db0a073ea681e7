// ============================================================================
// Query Descriptor Types
// ============================================================================
//
// Declarative filter / order / pagination / association intent. Produced by
// `QueryConditionBuilder`, consumed by accessors and storage engines. Nothing
// here performs I/O.
//
// ============================================================================

use crate::core::{DbError, EntityModel, Fields, Result, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// One filter condition on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `field = value`
    Eq { field: String, value: Value },
    /// `field IN (values)`; an empty list matches nothing.
    In { field: String, values: Vec<Value> },
    /// Inclusive range; a missing bound is open.
    Range {
        field: String,
        start: Option<Value>,
        end: Option<Value>,
    },
    /// Case-insensitive substring match on a text field.
    Search { field: String, term: String },
}

impl Predicate {
    pub fn field(&self) -> &str {
        match self {
            Predicate::Eq { field, .. }
            | Predicate::In { field, .. }
            | Predicate::Range { field, .. }
            | Predicate::Search { field, .. } => field,
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        let Some(actual) = fields.get(self.field()) else {
            return false;
        };

        match self {
            Predicate::Eq { value, .. } => actual.sql_eq(value),
            Predicate::In { values, .. } => values.iter().any(|v| actual.sql_eq(v)),
            Predicate::Range { start, end, .. } => {
                if actual.is_null() {
                    return false;
                }
                let after_start = match start {
                    Some(bound) => matches!(
                        actual.compare(bound),
                        Ok(Ordering::Greater | Ordering::Equal)
                    ),
                    None => true,
                };
                let before_end = match end {
                    Some(bound) => {
                        matches!(actual.compare(bound), Ok(Ordering::Less | Ordering::Equal))
                    }
                    None => true,
                };
                after_start && before_end
            }
            Predicate::Search { term, .. } => match actual {
                Value::Text(text) => text.to_lowercase().contains(&term.to_lowercase()),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl FromStr for Direction {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Direction::Asc),
            "DESC" => Ok(Direction::Desc),
            other => Err(DbError::Validation(format!(
                "Unknown sort direction '{}', expected ASC or DESC",
                other
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Asc => write!(f, "ASC"),
            Direction::Desc => write!(f, "DESC"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

/// 1-indexed page request, already clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: usize,
    pub size: usize,
}

impl Pagination {
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// The parent row holds `foreign_key` pointing at the target's primary key.
    BelongsTo,
    /// The target rows hold `foreign_key` pointing at the parent's primary key.
    HasMany,
}

/// An association to eager-load alongside the parent rows.
#[derive(Debug, Clone)]
pub struct Association {
    name: String,
    target: Arc<EntityModel>,
    foreign_key: String,
    kind: AssociationKind,
}

impl Association {
    pub fn belongs_to(
        name: impl Into<String>,
        target: Arc<EntityModel>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            foreign_key: foreign_key.into(),
            kind: AssociationKind::BelongsTo,
        }
    }

    pub fn has_many(
        name: impl Into<String>,
        target: Arc<EntityModel>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            foreign_key: foreign_key.into(),
            kind: AssociationKind::HasMany,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Arc<EntityModel> {
        &self.target
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn kind(&self) -> AssociationKind {
        self.kind
    }
}

impl PartialEq for Association {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.foreign_key == other.foreign_key
            && self.kind == other.kind
            && self.target.name() == other.target.name()
    }
}

/// Immutable, finalized query intent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryDescriptor {
    pub(crate) predicates: Vec<Predicate>,
    pub(crate) pagination: Option<Pagination>,
    pub(crate) order: Vec<OrderBy>,
    pub(crate) includes: Vec<Association>,
    pub(crate) organization_field: Option<String>,
    pub(crate) user_field: Option<String>,
}

impl QueryDescriptor {
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn predicate_for(&self, field: &str) -> Option<&Predicate> {
        self.predicates.iter().find(|p| p.field() == field)
    }

    pub fn pagination(&self) -> Option<Pagination> {
        self.pagination
    }

    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    pub fn includes(&self) -> &[Association] {
        &self.includes
    }

    /// Organization the query is scoped to, if `filter_by_organization` was used.
    pub fn organization_scope(&self) -> Option<&Value> {
        self.scope_value(self.organization_field.as_deref())
    }

    /// User the query is scoped to, if `filter_by_user` was used.
    pub fn user_scope(&self) -> Option<&Value> {
        self.scope_value(self.user_field.as_deref())
    }

    fn scope_value(&self, field: Option<&str>) -> Option<&Value> {
        match self.predicate_for(field?)? {
            Predicate::Eq { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.predicates.iter().all(|p| p.matches(fields))
    }
}
