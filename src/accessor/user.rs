use super::{BaseAccessor, Page, PageRequest, WriteOptions};
use crate::core::{AttributeSpec, DataType, DefaultValue, EntityModel, Fields, Record, Result, Value};
use crate::fields;
use std::ops::Deref;

pub const USERS_TABLE: &str = "users";

/// Tenant-scoped user accounts. `password_hash` is redacted in write logs.
pub fn user_model() -> EntityModel {
    EntityModel::new(USERS_TABLE, "id")
        .attribute(
            AttributeSpec::new("id", DataType::Text)
                .not_null()
                .default_value(DefaultValue::Uuid),
        )
        .attribute(AttributeSpec::new("organization_id", DataType::Text).not_null())
        .attribute(AttributeSpec::new("email", DataType::Text).not_null().unique())
        .attribute(AttributeSpec::new("name", DataType::Text))
        .attribute(AttributeSpec::new("password_hash", DataType::Text))
        .attribute(
            AttributeSpec::new("role", DataType::Text)
                .not_null()
                .default_value(DefaultValue::Value(Value::from("member"))),
        )
        .with_timestamps()
}

#[derive(Debug, Clone)]
pub struct UserAccessor {
    base: BaseAccessor,
}

impl UserAccessor {
    pub fn new(base: BaseAccessor) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &BaseAccessor {
        &self.base
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<Record>> {
        self.base
            .find_one(&fields! { "email" => email.trim().to_lowercase() }, None)
            .await
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

    /// Creates a user, storing the email lower-cased.
    pub async fn register(&self, mut attributes: Fields, options: &WriteOptions) -> Result<Record> {
        if let Some(Value::Text(email)) = attributes.get_mut("email") {
            *email = email.trim().to_lowercase();
        }
        self.base.create(attributes, options).await
    }

    pub async fn change_role(&self, id: &str, role: &str, options: &WriteOptions) -> Result<Record> {
        self.base
            .update_by_id(id, fields! { "role" => role }, options)
            .await
    }
}

impl Deref for UserAccessor {
    type Target = BaseAccessor;

    fn deref(&self) -> &BaseAccessor {
        &self.base
    }
}
