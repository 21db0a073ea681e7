/// Base accessor CRUD tests
///
/// Run with: cargo test --test accessor_tests

mod common;

use common::fixture;
use feedback_dal::core::{FOREIGN_KEY_VIOLATION, UNIQUE_VIOLATION};
use feedback_dal::{DbError, Value, WriteOptions, fields};
use std::time::Duration;

#[tokio::test]
async fn test_create_fills_generated_attributes() {
    let fx = fixture().await;

    let record = fx
        .feedback
        .create(fx.item("org-1", "Dark mode"), &WriteOptions::default())
        .await
        .unwrap();

    assert_eq!(record.get_i64("id"), Some(1));
    assert_eq!(record.get_str("status"), Some("open"));
    assert_eq!(record.get_i64("votes"), Some(0));
    assert!(matches!(record.get("created_at"), Some(Value::Timestamp(_))));
    assert!(matches!(record.get("updated_at"), Some(Value::Timestamp(_))));

    let author = fx.users.find_by_id(fx.author_id.as_str()).await.unwrap().unwrap();
    assert_eq!(author.get_str("role"), Some("member"));
    assert_eq!(author.get_str("id").map(str::len), Some(36));
}

#[tokio::test]
async fn test_create_rejects_invalid_attributes() {
    let fx = fixture().await;
    let none = WriteOptions::default();

    let mut unknown = fx.item("org-1", "Typo");
    unknown.insert("colour".into(), Value::from("red"));
    let err = fx.feedback.create(unknown, &none).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));

    let mut wrong_type = fx.item("org-1", "Typo");
    wrong_type.insert("votes".into(), Value::from("many"));
    let err = fx.feedback.create(wrong_type, &none).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));

    let missing = fields! { "organization_id" => "org-1", "user_id" => fx.author_id.as_str() };
    let err = fx.feedback.create(missing, &none).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));

    assert_eq!(fx.feedback_count().await, 0);
}

#[tokio::test]
async fn test_unique_violation_carries_code() {
    let fx = fixture().await;

    let err = fx
        .users
        .register(
            fields! { "organization_id" => "org-2", "email" => "AUTHOR@example.com" },
            &WriteOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(UNIQUE_VIOLATION));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_foreign_keys_enforced() {
    let fx = fixture().await;
    let none = WriteOptions::default();

    let orphan = fields! {
        "organization_id" => "org-1",
        "user_id" => "no-such-user",
        "title" => "Orphan",
    };
    let err = fx.feedback.create(orphan, &none).await.unwrap_err();
    assert_eq!(err.code(), Some(FOREIGN_KEY_VIOLATION));

    fx.seed("org-1", 1).await;
    let err = fx
        .users
        .delete_by_id(fx.author_id.as_str(), &none)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(FOREIGN_KEY_VIOLATION));
    assert!(fx.users.find_by_id(fx.author_id.as_str()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_find_all_defaults_to_primary_key_order() {
    let fx = fixture().await;
    fx.seed("org-1", 5).await;
    fx.seed("org-2", 2).await;

    let rows = fx
        .feedback
        .find_all(&fields! { "organization_id" => "org-1" }, None)
        .await
        .unwrap();
    let ids: Vec<i64> = rows.iter().filter_map(|r| r.get_i64("id")).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    let empty = fx
        .feedback
        .find_all(&fields! { "organization_id" => "org-9" }, None)
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_descriptor_predicate_overrides_filter_entry() {
    let fx = fixture().await;
    fx.seed("org-1", 3).await;
    fx.seed("org-2", 4).await;

    let mut builder = fx.feedback.query();
    builder.filter_by_organization("org-2");
    let query = builder.get_query();

    let count = fx
        .feedback
        .count(&fields! { "organization_id" => "org-1" }, Some(&query))
        .await
        .unwrap();
    assert_eq!(count, 4);
}

#[tokio::test]
async fn test_unknown_filter_field_rejected() {
    let fx = fixture().await;

    let err = fx
        .feedback
        .find_all(&fields! { "colour" => "red" }, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[tokio::test]
async fn test_find_one_and_find_by_email() {
    let fx = fixture().await;
    fx.seed("org-1", 3).await;

    let first = fx
        .feedback
        .find_one(&fields! { "organization_id" => "org-1" }, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.get_str("title"), Some("Item 1"));

    let missing = fx
        .feedback
        .find_one(&fields! { "organization_id" => "org-3" }, None)
        .await
        .unwrap();
    assert!(missing.is_none());

    let author = fx.users.find_by_email(" Author@Example.COM ").await.unwrap();
    assert_eq!(
        author.and_then(|r| r.get_str("id").map(str::to_string)),
        Some(fx.author_id.clone())
    );
}

#[tokio::test]
async fn test_update_by_id() {
    let fx = fixture().await;
    let none = WriteOptions::default();
    let created = fx.seed("org-1", 1).await.remove(0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let updated = fx
        .feedback
        .update_status(1, "planned", &none)
        .await
        .unwrap();
    assert_eq!(updated.get_str("status"), Some("planned"));
    assert_eq!(updated.get("created_at"), created.get("created_at"));
    assert!(updated.get("updated_at") > created.get("updated_at"));

    let err = fx.feedback.update_by_id(99, fields! { "title" => "x" }, &none).await.unwrap_err();
    assert!(matches!(err, DbError::NotFound { .. }));

    let err = fx.feedback.update_by_id(1, fields! { "id" => 2i64 }, &none).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));

    let err = fx.feedback.update_status(1, "someday", &none).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let fx = fixture().await;
    let none = WriteOptions::default();
    fx.seed("org-1", 2).await;

    assert!(fx.feedback.delete_by_id(1, &none).await.unwrap());
    assert!(!fx.feedback.delete_by_id(1, &none).await.unwrap());
    assert!(fx.feedback.find_by_id(1).await.unwrap().is_none());
    assert_eq!(fx.feedback_count().await, 1);
}

#[tokio::test]
async fn test_search_includes_author() {
    let fx = fixture().await;
    let none = WriteOptions::default();
    fx.feedback.create(fx.item("org-1", "Slow dashboard"), &none).await.unwrap();
    fx.feedback.create(fx.item("org-1", "Export to CSV"), &none).await.unwrap();
    fx.feedback.create(fx.item("org-2", "Slow login"), &none).await.unwrap();

    let hits = fx.feedback.search("org-1", "SLOW").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].get_str("title"), Some("Slow dashboard"));

    let author = hits[0].association("author").unwrap();
    assert_eq!(author.len(), 1);
    assert_eq!(author[0].get_str("email"), Some("author@example.com"));
}

#[tokio::test]
async fn test_bulk_create_is_all_or_nothing() {
    let fx = fixture().await;

    let rows = vec![
        fx.item("org-1", "First"),
        fx.item("org-1", "Second"),
        fields! { "organization_id" => "org-1", "user_id" => "ghost", "title" => "Third" },
    ];
    let err = fx
        .feedback
        .bulk_create(rows, &WriteOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(FOREIGN_KEY_VIOLATION));
    assert_eq!(fx.feedback_count().await, 0);
}
