//! Transaction propagation against the stub driver.

mod common;

use common::{StubBehavior, StubConnector, StubPool, config};
use pg_lifecycle::db::{
    ConnectionManager, Context, IsolationLevel, Statement, TransactionState, TxOptions,
};
use pg_lifecycle::{DbError, DbResult};
use std::sync::Arc;
use std::time::Duration;

type Manager = ConnectionManager<StubConnector>;

async fn connected(behavior: &Arc<StubBehavior>) -> Manager {
    let manager =
        ConnectionManager::with_connector(&config(1, 10), StubConnector::new(behavior));
    manager.connect().await.unwrap();
    manager
}

/// Data-access helper that joins whatever transaction the context carries.
async fn insert(manager: &Manager, ctx: &Context<StubPool>, sql: &'static str) -> DbResult<bool> {
    manager
        .try_with_transaction(ctx, |stmt| {
            Box::pin(async move {
                let transactional = stmt.is_transactional();
                match stmt {
                    Statement::Transaction(conn) => conn.exec(sql),
                    Statement::Pool(pool) => pool.exec(sql),
                }
                Ok::<_, DbError>(transactional)
            })
        })
        .await
}

#[tokio::test]
async fn test_success_commits() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;

    let value = manager
        .run_in_read_committed_tx(&Context::background(), |ctx| {
            let manager = &manager;
            async move {
                assert!(ctx.in_transaction());
                assert!(insert(manager, &ctx, "INSERT a").await?);
                Ok::<_, DbError>(42)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(
        behavior.events(),
        vec!["begin:DEFAULT", "tx:INSERT a", "commit"]
    );
}

#[tokio::test]
async fn test_callback_error_rolls_back() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;

    let result: DbResult<()> = manager
        .run_in_read_committed_tx(&Context::background(), |ctx| {
            let manager = &manager;
            async move {
                insert(manager, &ctx, "INSERT a").await?;
                Err::<(), _>(DbError::internal("work failed"))
            }
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("work failed"));
    assert_eq!(behavior.count("rollback"), 1);
    assert_eq!(behavior.count("commit"), 0);
}

#[tokio::test]
async fn test_rollback_failure_replaces_callback_error() {
    let behavior = StubBehavior::new();
    StubBehavior::set(&behavior.fail_rollback, true);
    let manager = connected(&behavior).await;

    let result: DbResult<()> = manager
        .run_in_read_committed_tx(&Context::background(), |_ctx| async {
            Err(DbError::internal("work failed"))
        })
        .await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("rollback failed"), "{err}");
    assert_eq!(behavior.count("rollback_failed"), 1);
}

#[tokio::test]
async fn test_commit_failure_surfaces() {
    let behavior = StubBehavior::new();
    StubBehavior::set(&behavior.fail_commit, true);
    let manager = connected(&behavior).await;

    let result = manager
        .run_in_read_committed_tx(&Context::background(), |_ctx| async { Ok::<_, DbError>(1) })
        .await;

    assert!(result.unwrap_err().to_string().contains("commit failed"));
    assert_eq!(behavior.count("rollback"), 0);
}

#[tokio::test]
async fn test_begin_failure_skips_callback() {
    let behavior = StubBehavior::new();
    StubBehavior::set(&behavior.fail_begin, true);
    let manager = connected(&behavior).await;

    let mut called = false;
    let result = manager
        .run_in_read_committed_tx(&Context::background(), |_ctx| {
            called = true;
            async { Ok::<_, DbError>(()) }
        })
        .await;

    assert!(result.is_err());
    assert!(!called);
}

#[tokio::test]
async fn test_read_uncommitted_options() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;

    manager
        .run_in_read_uncommitted_tx(&Context::background(), |ctx| async move {
            let ambient = ctx.transaction().expect("ambient transaction");
            assert_eq!(
                ambient.options(),
                TxOptions::with_isolation(IsolationLevel::ReadUncommitted)
            );
            assert!(ambient.id().starts_with("tx_"));
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

    assert_eq!(behavior.events()[0], "begin:READ UNCOMMITTED");
}

#[tokio::test]
async fn test_try_without_transaction_uses_pool() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;

    let transactional = insert(&manager, &Context::background(), "INSERT a")
        .await
        .unwrap();

    assert!(!transactional);
    assert_eq!(behavior.events(), vec!["pool:INSERT a"]);
}

#[tokio::test]
async fn test_must_without_transaction_does_not_call_work() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;

    let mut called = false;
    let result: DbResult<()> = manager
        .must_with_transaction(&Context::background(), |_conn| {
            called = true;
            Box::pin(async { Ok::<_, DbError>(()) })
        })
        .await;

    assert!(matches!(result, Err(DbError::NoTransactionInContext)));
    assert!(!called);
    assert!(behavior.events().is_empty());
}

#[tokio::test]
async fn test_must_inside_transaction_uses_its_connection() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;

    manager
        .run_in_read_committed_tx(&Context::background(), |ctx| {
            let manager = &manager;
            async move {
                manager
                    .must_with_transaction(&ctx, |conn| {
                        Box::pin(async move {
                            conn.exec("UPDATE b");
                            Ok::<_, DbError>(())
                        })
                    })
                    .await
            }
        })
        .await
        .unwrap();

    assert_eq!(
        behavior.events(),
        vec!["begin:DEFAULT", "tx:UPDATE b", "commit"]
    );
}

#[tokio::test]
async fn test_contextual_commit_twice_is_rejected() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;
    let root = Context::background();

    let ctx = manager.begin_contextual(&root).await.unwrap();
    assert!(ctx.in_transaction());
    assert!(!root.in_transaction());

    insert(&manager, &ctx, "INSERT a").await.unwrap();
    manager.commit_contextual(&ctx).await.unwrap();

    assert!(matches!(
        manager.commit_contextual(&ctx).await,
        Err(DbError::TransactionTerminated { .. })
    ));
    assert!(matches!(
        manager.rollback_contextual(&ctx).await,
        Err(DbError::TransactionTerminated { .. })
    ));
    assert_eq!(behavior.count("commit"), 1);
    assert_eq!(behavior.count("rollback"), 0);

    let ambient = ctx.transaction().unwrap();
    assert_eq!(ambient.state().await, TransactionState::Committed);
}

#[tokio::test]
async fn test_statement_after_rollback_is_rejected() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;

    let ctx = manager
        .begin_contextual(&Context::background())
        .await
        .unwrap();
    manager.rollback_contextual(&ctx).await.unwrap();

    assert!(matches!(
        insert(&manager, &ctx, "INSERT late").await,
        Err(DbError::TransactionTerminated { .. })
    ));
    assert!(!behavior.events().contains(&"tx:INSERT late".to_string()));
}

#[tokio::test]
async fn test_nested_use_of_held_connection_fails_fast() {
    let behavior = StubBehavior::new();
    let manager = Arc::new(connected(&behavior).await);
    let ctx = manager
        .begin_contextual(&Context::background())
        .await
        .unwrap();

    let inner_manager = Arc::clone(&manager);
    let inner_ctx = ctx.clone();
    let outer = manager.must_with_transaction(&ctx, move |conn| {
        let manager = inner_manager;
        let ctx = inner_ctx;
        Box::pin(async move {
            conn.exec("UPDATE a");

            let nested = insert(&manager, &ctx, "INSERT nested").await;
            assert!(matches!(nested, Err(DbError::TransactionBusy { .. })));

            let nested_must: DbResult<()> = manager
                .must_with_transaction(&ctx, |inner| {
                    Box::pin(async move {
                        inner.exec("UPDATE nested");
                        Ok::<_, DbError>(())
                    })
                })
                .await;
            assert!(matches!(nested_must, Err(DbError::TransactionBusy { .. })));

            assert!(matches!(
                manager.commit_contextual(&ctx).await,
                Err(DbError::TransactionBusy { .. })
            ));
            assert_eq!(
                ctx.transaction().unwrap().state().await,
                TransactionState::Open
            );
            Ok::<_, DbError>(())
        })
    });
    tokio::time::timeout(Duration::from_secs(5), outer)
        .await
        .expect("nested use must not wait on its own connection")
        .unwrap();

    // The connection is released once the outer statement returns.
    insert(&manager, &ctx, "INSERT after").await.unwrap();
    manager.commit_contextual(&ctx).await.unwrap();

    assert_eq!(
        behavior.events(),
        vec!["begin:DEFAULT", "tx:UPDATE a", "tx:INSERT after", "commit"]
    );
}

#[tokio::test]
async fn test_contextual_outside_transaction() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;
    let ctx = Context::background();

    assert!(matches!(
        manager.commit_contextual(&ctx).await,
        Err(DbError::NotInTransaction)
    ));
    assert!(matches!(
        manager.rollback_contextual(&ctx).await,
        Err(DbError::NotInTransaction)
    ));
}

#[tokio::test]
async fn test_sibling_contexts_do_not_share_transactions() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;
    let root = Context::background();

    let first = manager.begin_contextual(&root).await.unwrap();
    let second = manager.begin_contextual(&root).await.unwrap();

    let first_id = first.transaction().unwrap().id().to_string();
    let second_id = second.transaction().unwrap().id().to_string();
    assert_ne!(first_id, second_id);

    manager.commit_contextual(&first).await.unwrap();
    assert_eq!(
        second.transaction().unwrap().state().await,
        TransactionState::Open
    );
    manager.rollback_contextual(&second).await.unwrap();
}

#[tokio::test]
async fn test_nested_scope_starts_independent_transaction() {
    let behavior = StubBehavior::new();
    let manager = connected(&behavior).await;

    manager
        .run_in_read_committed_tx(&Context::background(), |outer| {
            let manager = &manager;
            async move {
                let outer_id = outer.transaction().unwrap().id().to_string();
                manager
                    .run_in_read_committed_tx(&outer, |inner| async move {
                        assert_ne!(inner.transaction().unwrap().id(), outer_id);
                        Ok::<_, DbError>(())
                    })
                    .await
            }
        })
        .await
        .unwrap();

    assert_eq!(behavior.count("begin:DEFAULT"), 2);
    assert_eq!(behavior.count("commit"), 2);
}

#[tokio::test]
async fn test_transaction_requires_connection() {
    let behavior = StubBehavior::new();
    let manager =
        ConnectionManager::with_connector(&config(1, 10), StubConnector::new(&behavior));

    let result = manager.begin_contextual(&Context::background()).await;
    assert!(matches!(result, Err(DbError::NotConnected { .. })));
}
