/// Transaction scope tests: atomicity, savepoints, ambient context
///
/// Run with: cargo test --test transaction_tests

mod common;

use anyhow::anyhow;
use common::fixture;
use feedback_dal::{DbError, TransactionManager, TransactionState, WriteOptions, fields};

#[tokio::test]
async fn test_failed_scope_leaves_no_writes() {
    let fx = &fixture().await;
    let none = &WriteOptions::default();

    let result: Result<(), DbError> = fx
        .layer
        .transactions()
        .with_transaction(|_| async {
            for n in 1..=3 {
                fx.feedback
                    .create(fx.item("org-1", &format!("Pending {n}")), none)
                    .await?;
            }
            Err(DbError::Application(anyhow!("abort after three writes")))
        })
        .await;

    assert!(matches!(result, Err(DbError::Application(_))));
    assert_eq!(fx.feedback_count().await, 0);
}

#[tokio::test]
async fn test_successful_scope_commits_and_returns_value() {
    let fx = &fixture().await;
    let none = &WriteOptions::default();

    let ids = fx
        .layer
        .transactions()
        .with_transaction(|_| async {
            let a = fx.feedback.create(fx.item("org-1", "A"), none).await?;
            let b = fx.feedback.create(fx.item("org-1", "B"), none).await?;
            Ok((a.get_i64("id"), b.get_i64("id")))
        })
        .await
        .unwrap();

    assert_eq!(ids, (Some(1), Some(2)));
    assert_eq!(fx.feedback_count().await, 2);
}

#[tokio::test]
async fn test_inner_failure_rolls_back_to_savepoint_only() {
    let fx = &fixture().await;
    let none = &WriteOptions::default();
    let transactions = fx.layer.transactions();

    transactions
        .with_transaction(|outer| async move {
            fx.feedback.create(fx.item("org-1", "before"), none).await?;

            let outer_id = outer.id();
            let inner = transactions
                .with_transaction(|inner| async move {
                    assert_eq!(inner.id(), outer_id);
                    fx.feedback.create(fx.item("org-1", "inner"), none).await?;
                    Err::<(), _>(DbError::Validation("inner rejected".into()))
                })
                .await;
            assert!(matches!(inner, Err(DbError::Validation(_))));
            assert!(outer.is_active());

            fx.feedback.create(fx.item("org-1", "after"), none).await?;
            Ok(())
        })
        .await
        .unwrap();

    let titles: Vec<String> = fx
        .feedback
        .find_all(&fields! {}, None)
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.get_str("title").map(str::to_string))
        .collect();
    assert_eq!(titles, vec!["before", "after"]);
}

#[tokio::test]
async fn test_inner_error_propagated_by_outer_aborts_everything() {
    let fx = &fixture().await;
    let none = &WriteOptions::default();
    let transactions = fx.layer.transactions();

    let result = transactions
        .with_transaction(|_| async move {
            fx.feedback.create(fx.item("org-1", "outer"), none).await?;
            transactions
                .with_transaction(|_| async {
                    Err::<(), _>(DbError::Validation("inner rejected".into()))
                })
                .await?;
            Ok(())
        })
        .await;

    assert!(result.is_err());
    assert_eq!(fx.feedback_count().await, 0);
}

#[tokio::test]
async fn test_uncommitted_writes_invisible_outside() {
    let fx = &fixture().await;
    let none = &WriteOptions::default();

    fx.layer
        .transactions()
        .with_transaction(|_| async {
            fx.feedback.create(fx.item("org-1", "hidden"), none).await?;
            assert_eq!(fx.feedback_count().await, 1);

            // A separate task has no ambient context and reads committed state
            let feedback = fx.feedback.clone();
            let outside = tokio::spawn(async move {
                assert!(TransactionManager::current().is_none());
                feedback.count(&fields! {}, None).await
            })
            .await
            .unwrap()?;
            assert_eq!(outside, 0);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(fx.feedback_count().await, 1);
}

#[tokio::test]
async fn test_explicit_transaction_option() {
    let fx = &fixture().await;
    let feedback = fx.feedback.clone();
    let item = fx.item("org-1", "explicit");

    // The write runs on a spawned task, outside the ambient scope
    let result: Result<(), DbError> = fx
        .layer
        .transactions()
        .with_transaction(|ctx| async move {
            let options = WriteOptions::in_transaction(&ctx);
            tokio::spawn(async move { feedback.create(item, &options).await })
                .await
                .unwrap()?;
            Err(DbError::Validation("discard".into()))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(fx.feedback_count().await, 0);
}

#[tokio::test]
async fn test_leaked_context_is_terminal() {
    let fx = &fixture().await;

    let leaked = fx
        .layer
        .transactions()
        .with_named_transaction("leaky", |ctx| async move { Ok(ctx) })
        .await
        .unwrap();

    assert_eq!(leaked.state(), TransactionState::Committed);
    assert_eq!(leaked.name(), Some("leaky"));
    assert!(TransactionManager::current().is_none());

    let err = fx
        .feedback
        .create(fx.item("org-1", "late"), &WriteOptions::in_transaction(&leaked))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::TransactionState(_)));
}

#[tokio::test]
async fn test_rolled_back_context_state() {
    let fx = &fixture().await;
    let mut leaked = None;

    let _ = fx
        .layer
        .transactions()
        .with_transaction(|ctx| {
            leaked = Some(ctx);
            async { Err::<(), _>(DbError::Validation("no".into())) }
        })
        .await;

    assert_eq!(leaked.unwrap().state(), TransactionState::RolledBack);
}

#[tokio::test]
async fn test_connections_returned_after_scopes() {
    let fx = &fixture().await;
    let transactions = fx.layer.transactions();

    transactions
        .with_transaction(|_| async { Ok(()) })
        .await
        .unwrap();
    let _ = transactions
        .with_transaction(|_| async { Err::<(), _>(DbError::Validation("no".into())) })
        .await;

    let stats = fx.layer.pool_stats().await;
    assert_eq!(stats.active_connections, 0);
    assert!(stats.total_connections >= 1);
}

#[tokio::test]
async fn test_other_layer_keeps_its_own_transactions() {
    let a = &fixture().await;
    let b = &fixture().await;
    let none = &WriteOptions::default();

    let result: Result<(), DbError> = a
        .layer
        .transactions()
        .with_transaction(|_| async move {
            assert!(TransactionManager::current().is_some());
            assert!(b.layer.transactions().ambient().is_none());

            // Autocommit on layer b, not a write into a's transaction
            b.users
                .register(
                    fields! { "organization_id" => "org-1", "email" => "b@example.com" },
                    none,
                )
                .await?;

            // A scope on layer b is top-level there; a still owns its writes inside it
            b.layer
                .transactions()
                .with_transaction(|_| async move {
                    a.feedback.create(a.item("org-1", "in a"), none).await?;
                    b.feedback.create(b.item("org-1", "in b"), none).await
                })
                .await?;

            Err(DbError::Application(anyhow!("roll back layer a")))
        })
        .await;

    assert!(matches!(result, Err(DbError::Application(_))));
    assert_eq!(a.feedback_count().await, 0);
    assert!(a.users.find_by_email("b@example.com").await.unwrap().is_none());

    assert!(b.users.find_by_email("b@example.com").await.unwrap().is_some());
    assert_eq!(b.feedback_count().await, 1);
    assert_eq!(a.layer.pool_stats().await.active_connections, 0);
    assert_eq!(b.layer.pool_stats().await.active_connections, 0);
}

#[tokio::test]
async fn test_explicit_transaction_from_other_layer_rejected() {
    let a = &fixture().await;
    let b = &fixture().await;

    let err = a
        .layer
        .transactions()
        .with_transaction(|ctx| async move {
            b.feedback
                .create(b.item("org-1", "misrouted"), &WriteOptions::in_transaction(&ctx))
                .await
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Validation(_)));
    assert_eq!(a.feedback_count().await, 0);
    assert_eq!(b.feedback_count().await, 0);
}

#[tokio::test]
async fn test_sibling_savepoint_scopes_run_in_order() {
    let fx = &fixture().await;
    let none = &WriteOptions::default();
    let transactions = fx.layer.transactions();

    let (first, second) = transactions
        .with_transaction(|_| async move {
            let (first, second) = tokio::join!(
                transactions.with_transaction(|_| async {
                    fx.feedback.create(fx.item("org-1", "first"), none).await?;
                    tokio::task::yield_now().await;
                    Err::<(), _>(DbError::Validation("first rejected".into()))
                }),
                transactions.with_transaction(|ctx| async move {
                    // The first scope is fully rolled back before this one opens
                    assert_eq!(ctx.savepoint_depth().await, 1);
                    fx.feedback.create(fx.item("org-1", "second"), none).await?;
                    Ok(())
                }),
            );
            Ok((first, second))
        })
        .await
        .unwrap();

    assert!(matches!(first, Err(DbError::Validation(_))));
    assert!(second.is_ok(), "{second:?}");

    let titles: Vec<String> = fx
        .feedback
        .find_all(&fields! {}, None)
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.get_str("title").map(str::to_string))
        .collect();
    assert_eq!(titles, vec!["second"]);
}
