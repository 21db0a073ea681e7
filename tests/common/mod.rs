//! Shared helpers for integration tests.
#![allow(dead_code)]

use feedback_dal::{
    DataLayer, DataLayerConfig, FeedbackAccessor, Fields, MemoryEngine, Record, StorageEngine,
    UserAccessor, WriteOptions, fields,
};
use std::sync::Arc;

pub struct Fixture {
    pub layer: DataLayer,
    pub engine: Arc<MemoryEngine>,
    pub users: UserAccessor,
    pub feedback: FeedbackAccessor,
    /// Id of a user in `org-1` that seeded feedback belongs to.
    pub author_id: String,
}

pub async fn fixture() -> Fixture {
    fixture_with(DataLayerConfig::default()).await
}

pub async fn fixture_with(config: DataLayerConfig) -> Fixture {
    let engine = Arc::new(MemoryEngine::new());
    let layer = DataLayer::open(config, Arc::clone(&engine) as Arc<dyn StorageEngine>)
        .await
        .unwrap();
    let users = layer.users().await.unwrap();
    let feedback = layer.feedback().await.unwrap();

    let author = users
        .register(
            fields! {
                "organization_id" => "org-1",
                "email" => "author@example.com",
                "name" => "Author",
            },
            &WriteOptions::default(),
        )
        .await
        .unwrap();
    let author_id = author.get_str("id").unwrap().to_string();

    Fixture {
        layer,
        engine,
        users,
        feedback,
        author_id,
    }
}

impl Fixture {
    pub fn item(&self, organization_id: &str, title: &str) -> Fields {
        fields! {
            "organization_id" => organization_id,
            "user_id" => self.author_id.as_str(),
            "title" => title,
        }
    }

    /// Inserts `count` feedback rows titled `Item 1..=count`.
    pub async fn seed(&self, organization_id: &str, count: usize) -> Vec<Record> {
        let rows = (1..=count)
            .map(|n| self.item(organization_id, &format!("Item {n}")))
            .collect();
        self.feedback
            .bulk_create(rows, &WriteOptions::default())
            .await
            .unwrap()
    }

    pub async fn feedback_count(&self) -> u64 {
        self.feedback.count(&fields! {}, None).await.unwrap()
    }
}
