/// execute_raw_query tests: bindings only, one statement, transaction aware
///
/// Run with: cargo test --test raw_query_tests

mod common;

use common::fixture;
use feedback_dal::{DbError, Value, WriteOptions};

#[tokio::test]
async fn test_select_with_bindings() {
    let fx = fixture().await;
    fx.seed("org-1", 3).await;
    fx.seed("org-2", 2).await;

    let result = fx
        .feedback
        .execute_raw_query(
            "SELECT id, title FROM feedback WHERE organization_id = $1 ORDER BY id DESC LIMIT 2",
            &["org-1".into()],
        )
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["id", "title"]);
    assert_eq!(result.row_count(), 2);
    assert_eq!(result.rows[0].get("id"), Some(&Value::Integer(3)));
    assert_eq!(result.rows[1].get("title"), Some(&Value::from("Item 2")));
    assert!(!result.rows[0].contains_key("organization_id"));
}

#[tokio::test]
async fn test_count_returns_scalar() {
    let fx = fixture().await;
    fx.seed("org-1", 4).await;

    let result = fx
        .feedback
        .execute_raw_query(
            "SELECT COUNT(*) FROM feedback WHERE title ILIKE $1",
            &["item%".into()],
        )
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["count"]);
    assert_eq!(
        result.first().and_then(|row| row.get("count")),
        Some(&Value::Integer(4))
    );
}

#[tokio::test]
async fn test_update_reports_rows_affected() {
    let fx = fixture().await;
    fx.seed("org-1", 3).await;

    let result = fx
        .feedback
        .execute_raw_query(
            "UPDATE feedback SET status = $1 WHERE organization_id = $2",
            &["closed".into(), "org-1".into()],
        )
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 3);
    assert!(result.is_empty());

    let closed = fx
        .feedback
        .count(&feedback_dal::fields! { "status" => "closed" }, None)
        .await
        .unwrap();
    assert_eq!(closed, 3);
}

#[tokio::test]
async fn test_inline_literals_rejected() {
    let fx = fixture().await;

    for sql in [
        "SELECT * FROM feedback WHERE status = 'open'",
        "SELECT * FROM feedback WHERE id = 1",
        "DELETE FROM feedback WHERE title = 'x' OR 1 = 1",
    ] {
        let err = fx.feedback.execute_raw_query(sql, &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)), "{sql}");
    }
}

#[tokio::test]
async fn test_multiple_statements_rejected() {
    let fx = fixture().await;
    fx.seed("org-1", 1).await;

    let err = fx
        .feedback
        .execute_raw_query(
            "SELECT * FROM feedback WHERE id = $1; DELETE FROM feedback",
            &[Value::Integer(1)],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Validation(_)));
    assert_eq!(fx.feedback_count().await, 1);
}

#[tokio::test]
async fn test_binding_count_mismatch_rejected() {
    let fx = fixture().await;

    let too_few = fx
        .feedback
        .execute_raw_query("SELECT * FROM feedback WHERE id = $1 AND status = $2", &[Value::Integer(1)])
        .await;
    assert!(matches!(too_few, Err(DbError::Validation(_))));

    let too_many = fx
        .feedback
        .execute_raw_query("SELECT * FROM feedback WHERE id = $1", &[Value::Integer(1), Value::Integer(2)])
        .await;
    assert!(matches!(too_many, Err(DbError::Validation(_))));
}

#[tokio::test]
async fn test_raw_query_sees_ambient_transaction() {
    let fx = &fixture().await;
    let none = &WriteOptions::default();

    // An autocommit query could not see the row before the scope commits
    let inside = fx
        .layer
        .transactions()
        .with_transaction(|_| async {
            fx.feedback.create(fx.item("org-1", "pending"), none).await?;
            fx.feedback
                .execute_raw_query(
                    "SELECT COUNT(*) FROM feedback WHERE title = $1",
                    &["pending".into()],
                )
                .await
        })
        .await
        .unwrap();

    assert_eq!(
        inside.first().and_then(|row| row.get("count")),
        Some(&Value::Integer(1))
    );
}
