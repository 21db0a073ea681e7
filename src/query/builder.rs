use super::predicate::{Association, OrderBy, Pagination, Predicate, QueryDescriptor};
use crate::core::{DbError, Result, Value};
use chrono::{DateTime, Utc};

pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_ORGANIZATION_FIELD: &str = "organization_id";
pub const DEFAULT_USER_FIELD: &str = "user_id";

/// Fluent construction of a [`QueryDescriptor`].
///
/// Predicates are keyed by field: adding a second predicate on a field
/// replaces the first (last write wins). The builder stays usable after
/// [`get_query`](Self::get_query).
///
/// # Examples
///
/// ```
/// use feedback_dal::query::QueryConditionBuilder;
///
/// # fn main() -> feedback_dal::Result<()> {
/// let mut builder = QueryConditionBuilder::new();
/// builder
///     .filter_by_organization("org-1")
///     .filter_by_in("status", vec!["open".into(), "planned".into()])
///     .add_pagination(2, 20)?
///     .add_order_by("created_at", "DESC")?;
///
/// let query = builder.get_query();
/// assert_eq!(query.predicates().len(), 2);
/// assert_eq!(query.pagination().unwrap().offset(), 20);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct QueryConditionBuilder {
    predicates: Vec<Predicate>,
    pagination: Option<Pagination>,
    order: Vec<OrderBy>,
    includes: Vec<Association>,
    max_page_size: usize,
    organization_field: String,
    user_field: String,
}

impl Default for QueryConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryConditionBuilder {
    pub fn new() -> Self {
        Self {
            predicates: Vec::new(),
            pagination: None,
            order: Vec::new(),
            includes: Vec::new(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            organization_field: DEFAULT_ORGANIZATION_FIELD.to_string(),
            user_field: DEFAULT_USER_FIELD.to_string(),
        }
    }

    /// Upper bound applied to page sizes. Values below 1 are treated as 1.
    pub fn with_max_page_size(mut self, max: usize) -> Self {
        self.max_page_size = max.max(1);
        self
    }

    /// Overrides the attribute names used for organization and user scoping.
    pub fn with_scope_fields(
        mut self,
        organization_field: impl Into<String>,
        user_field: impl Into<String>,
    ) -> Self {
        self.organization_field = organization_field.into();
        self.user_field = user_field.into();
        self
    }

    pub fn filter_by_organization(&mut self, id: impl Into<Value>) -> &mut Self {
        let field = self.organization_field.clone();
        self.filter_by_eq(field, id)
    }

    pub fn filter_by_user(&mut self, id: impl Into<Value>) -> &mut Self {
        let field = self.user_field.clone();
        self.filter_by_eq(field, id)
    }

    pub fn filter_by_eq(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.put(Predicate::Eq {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn filter_by_in(&mut self, field: impl Into<String>, values: Vec<Value>) -> &mut Self {
        self.put(Predicate::In {
            field: field.into(),
            values,
        })
    }

    /// Case-insensitive substring search. Blank terms are rejected.
    pub fn search_by_field(
        &mut self,
        field: impl Into<String>,
        term: impl Into<String>,
    ) -> Result<&mut Self> {
        let term = term.into();
        if term.trim().is_empty() {
            return Err(DbError::Validation("Search term cannot be empty".into()));
        }
        Ok(self.put(Predicate::Search {
            field: field.into(),
            term: term.trim().to_string(),
        }))
    }

    /// Inclusive date range; either bound may be open but not both.
    pub fn add_date_range(
        &mut self,
        field: impl Into<String>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<&mut Self> {
        let field = field.into();
        match (start, end) {
            (None, None) => {
                return Err(DbError::Validation(format!(
                    "Date range on '{}' needs at least one bound",
                    field
                )));
            }
            (Some(s), Some(e)) if s > e => {
                return Err(DbError::Validation(format!(
                    "Date range on '{}' starts after it ends",
                    field
                )));
            }
            _ => {}
        }

        Ok(self.put(Predicate::Range {
            field,
            start: start.map(Value::Timestamp),
            end: end.map(Value::Timestamp),
        }))
    }

    /// 1-indexed pagination; `size` is clamped to the configured maximum.
    pub fn add_pagination(&mut self, page: usize, size: usize) -> Result<&mut Self> {
        if page == 0 {
            return Err(DbError::Validation("Page must be >= 1".into()));
        }
        if size == 0 {
            return Err(DbError::Validation("Page size must be >= 1".into()));
        }

        self.pagination = Some(Pagination {
            page,
            size: size.min(self.max_page_size),
        });
        Ok(self)
    }

    /// Appends an ordering; `direction` must be `ASC` or `DESC` (any case).
    pub fn add_order_by(
        &mut self,
        field: impl Into<String>,
        direction: impl AsRef<str>,
    ) -> Result<&mut Self> {
        let field = field.into();
        if field.trim().is_empty() {
            return Err(DbError::Validation("Order field cannot be empty".into()));
        }
        let direction = direction.as_ref().parse()?;

        self.order.retain(|o| o.field != field);
        self.order.push(OrderBy::new(field, direction));
        Ok(self)
    }

    /// Eager-loads an association. A second include with the same name replaces the first.
    pub fn add_include(&mut self, association: Association) -> &mut Self {
        match self
            .includes
            .iter_mut()
            .find(|existing| existing.name() == association.name())
        {
            Some(existing) => *existing = association,
            None => self.includes.push(association),
        }
        self
    }

    /// Snapshot of the accumulated intent.
    pub fn get_query(&self) -> QueryDescriptor {
        QueryDescriptor {
            predicates: self.predicates.clone(),
            pagination: self.pagination,
            order: self.order.clone(),
            includes: self.includes.clone(),
            organization_field: Some(self.organization_field.clone()),
            user_field: Some(self.user_field.clone()),
        }
    }

    fn put(&mut self, predicate: Predicate) -> &mut Self {
        match self
            .predicates
            .iter_mut()
            .find(|existing| existing.field() == predicate.field())
        {
            Some(existing) => *existing = predicate,
            None => self.predicates.push(predicate),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Direction;

    #[test]
    fn test_last_write_wins() {
        let mut builder = QueryConditionBuilder::new();
        builder
            .filter_by_in("status", vec!["open".into()])
            .filter_by_in("status", vec!["closed".into()]);

        let query = builder.get_query();
        assert_eq!(query.predicates().len(), 1);
        assert_eq!(
            query.predicates()[0],
            Predicate::In {
                field: "status".into(),
                values: vec!["closed".into()]
            }
        );
    }

    #[test]
    fn test_pagination_clamped() {
        let mut builder = QueryConditionBuilder::new().with_max_page_size(50);
        builder.add_pagination(3, 500).unwrap();
        let page = builder.get_query().pagination().unwrap();
        assert_eq!(page.size, 50);
        assert_eq!(page.offset(), 100);
    }

    #[test]
    fn test_pagination_rejects_zero() {
        let mut builder = QueryConditionBuilder::new();
        assert!(matches!(builder.add_pagination(0, 10), Err(DbError::Validation(_))));
        assert!(matches!(builder.add_pagination(1, 0), Err(DbError::Validation(_))));
    }

    #[test]
    fn test_order_by_validation() {
        let mut builder = QueryConditionBuilder::new();
        assert!(builder.add_order_by("created_at", "sideways").is_err());
        builder.add_order_by("created_at", "desc").unwrap();
        builder.add_order_by("title", "ASC").unwrap();
        builder.add_order_by("created_at", "ASC").unwrap();

        let order = builder.get_query().order().to_vec();
        assert_eq!(order.len(), 2);
        assert_eq!(order[1], OrderBy::new("created_at", Direction::Asc));
    }

    #[test]
    fn test_builder_reusable_after_get_query() {
        let mut builder = QueryConditionBuilder::new();
        builder.filter_by_organization("org-1");
        let first = builder.get_query();
        builder.filter_by_user(7i64);
        let second = builder.get_query();

        assert_eq!(first.predicates().len(), 1);
        assert_eq!(second.predicates().len(), 2);
        assert_eq!(second.organization_scope(), Some(&Value::from("org-1")));
        assert_eq!(second.user_scope(), Some(&Value::Integer(7)));
    }

    #[test]
    fn test_date_range_validation() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::days(1);
        let mut builder = QueryConditionBuilder::new();
        assert!(builder.add_date_range("created_at", None, None).is_err());
        assert!(builder.add_date_range("created_at", Some(now), Some(earlier)).is_err());
        builder.add_date_range("created_at", Some(earlier), None).unwrap();
        assert_eq!(builder.get_query().predicates().len(), 1);
    }

    #[test]
    fn test_blank_search_rejected() {
        let mut builder = QueryConditionBuilder::new();
        assert!(builder.search_by_field("title", "   ").is_err());
    }
}
