/// with_batch_transaction tests
///
/// Run with: cargo test --test batch_tests

mod common;

use common::fixture;
use feedback_dal::{BatchOperation, DbError, Record, WriteOptions, batch_op};

#[tokio::test]
async fn test_batch_returns_results_in_order() {
    let fx = fixture().await;

    let operations: Vec<BatchOperation<Record>> = ["first", "second", "third"]
        .into_iter()
        .map(|title| {
            let feedback = fx.feedback.clone();
            let item = fx.item("org-1", title);
            batch_op(move |ctx| async move {
                feedback.create(item, &WriteOptions::in_transaction(&ctx)).await
            })
        })
        .collect();

    let records = fx
        .layer
        .transactions()
        .with_batch_transaction(operations)
        .await
        .unwrap();

    let titles: Vec<&str> = records.iter().filter_map(|r| r.get_str("title")).collect();
    assert_eq!(titles, vec!["first", "second", "third"]);
    assert_eq!(fx.feedback_count().await, 3);
}

#[tokio::test]
async fn test_batch_failure_discards_earlier_operations() {
    let fx = fixture().await;
    let feedback = fx.feedback.clone();
    let first = fx.item("org-1", "kept?");
    let third = fx.item("org-1", "never runs");

    let operations: Vec<BatchOperation<Option<Record>>> = vec![
        batch_op({
            let feedback = feedback.clone();
            move |ctx| async move {
                feedback
                    .create(first, &WriteOptions::in_transaction(&ctx))
                    .await
                    .map(Some)
            }
        }),
        batch_op(|_| async { Err(DbError::Validation("second step rejected".into())) }),
        batch_op(move |ctx| async move {
            feedback
                .create(third, &WriteOptions::in_transaction(&ctx))
                .await
                .map(Some)
        }),
    ];

    let err = fx
        .layer
        .transactions()
        .with_batch_transaction(operations)
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Validation(_)));
    assert_eq!(fx.feedback_count().await, 0);
}

#[tokio::test]
async fn test_empty_batch_commits_nothing() {
    let fx = fixture().await;

    let results: Vec<()> = fx
        .layer
        .transactions()
        .with_batch_transaction(Vec::new())
        .await
        .unwrap();

    assert!(results.is_empty());
    assert_eq!(fx.layer.pool_stats().await.active_connections, 0);
}

#[tokio::test]
async fn test_batch_nested_in_outer_transaction_uses_savepoint() {
    let fx = &fixture().await;
    let transactions = fx.layer.transactions();
    let none = &WriteOptions::default();

    transactions
        .with_transaction(|_| async move {
            fx.feedback.create(fx.item("org-1", "outer"), none).await?;

            let failing: Vec<BatchOperation<()>> =
                vec![batch_op(|_| async { Err(DbError::Validation("nope".into())) })];
            let batch = transactions.with_batch_transaction(failing).await;
            assert!(batch.is_err());

            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(fx.feedback_count().await, 1);
}
