use super::user::USERS_TABLE;
use super::{BaseAccessor, Page, PageRequest, WriteOptions};
use crate::core::{
    AttributeSpec, DataType, DbError, DefaultValue, EntityModel, Record, Result, Value,
};
use crate::fields;
use crate::query::{Association, QueryDescriptor};
use std::ops::Deref;
use std::sync::Arc;

pub const FEEDBACK_TABLE: &str = "feedback";

pub const STATUSES: &[&str] = &["open", "planned", "in_progress", "done", "closed"];

pub fn feedback_model() -> EntityModel {
    EntityModel::new(FEEDBACK_TABLE, "id")
        .attribute(AttributeSpec::new("id", DataType::Integer).auto_increment())
        .attribute(AttributeSpec::new("organization_id", DataType::Text).not_null())
        .attribute(
            AttributeSpec::new("user_id", DataType::Text)
                .not_null()
                .references(USERS_TABLE, "id"),
        )
        .attribute(AttributeSpec::new("title", DataType::Text).not_null())
        .attribute(AttributeSpec::new("description", DataType::Text))
        .attribute(
            AttributeSpec::new("status", DataType::Text)
                .not_null()
                .default_value(DefaultValue::Value(Value::from("open"))),
        )
        .attribute(
            AttributeSpec::new("votes", DataType::Integer)
                .not_null()
                .default_value(DefaultValue::Value(Value::Integer(0))),
        )
        .with_timestamps()
}

/// Feedback items with their author eager-loadable as `author`.
#[derive(Debug, Clone)]
pub struct FeedbackAccessor {
    base: BaseAccessor,
    users: Arc<EntityModel>,
}

impl FeedbackAccessor {
    pub fn new(base: BaseAccessor, users: Arc<EntityModel>) -> Self {
        Self { base, users }
    }

    pub fn base(&self) -> &BaseAccessor {
        &self.base
    }

    pub fn author(&self) -> Association {
        Association::belongs_to("author", Arc::clone(&self.users), "user_id")
    }

    pub async fn list_organization(
        &self,
        organization_id: &str,
        request: PageRequest,
    ) -> Result<Page<Record>> {
        self.base
            .find_with_pagination(&fields! { "organization_id" => organization_id }, request)
            .await
    }

    /// Title search within one organization, newest first, authors included.
    pub async fn search(&self, organization_id: &str, term: &str) -> Result<Vec<Record>> {
        let mut builder = self.base.query();
        builder
            .filter_by_organization(organization_id)
            .search_by_field("title", term)?
            .add_order_by("created_at", "DESC")?
            .add_include(self.author());
        let query: QueryDescriptor = builder.get_query();
        self.base.find_all(&fields! {}, Some(&query)).await
    }

    pub async fn update_status(
        &self,
        id: i64,
        status: &str,
        options: &WriteOptions,
    ) -> Result<Record> {
        if !STATUSES.contains(&status) {
            return Err(DbError::Validation(format!(
                "Unknown feedback status '{}', expected one of {:?}",
                status, STATUSES
            )));
        }
        self.base
            .update_by_id(id, fields! { "status" => status }, options)
            .await
    }

    /// Read-modify-write increment of `votes`.
    ///
    /// Two transactions that both write the row before either commits
    /// conflict at commit; run inside `with_retry` to replay the loser.
    pub async fn upvote(&self, id: i64, options: &WriteOptions) -> Result<Record> {
        let current = self.base.find_by_id_in(id, options).await?;
        let current = current.ok_or_else(|| DbError::not_found(FEEDBACK_TABLE, id))?;
        let votes = current.get_i64("votes").unwrap_or(0);

        self.base
            .update_by_id(id, fields! { "votes" => votes + 1 }, options)
            .await
    }
}

impl Deref for FeedbackAccessor {
    type Target = BaseAccessor;

    fn deref(&self) -> &BaseAccessor {
        &self.base
    }
}
