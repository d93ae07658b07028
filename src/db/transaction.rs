//! Transaction helpers layered on [`ConnectionManager`].
//!
//! Two styles are supported. Scoped helpers (`run_in_tx` and friends) begin a
//! transaction, hand the callback a [`Context`] carrying it, and commit or
//! roll back based on the callback's result. Contextual helpers
//! (`begin_contextual`, `commit_contextual`, `rollback_contextual`) leave the
//! boundaries to the caller.
//!
//! Statement code that should join whatever transaction is ambient uses
//! [`ConnectionManager::try_with_transaction`]; code that must only ever run
//! inside one uses [`ConnectionManager::must_with_transaction`].

use crate::db::connection::{COMPONENT, ConnectionManager};
use crate::db::context::{AmbientTransaction, Context};
use crate::db::driver::{ConnectionOf, Connector, IsolationLevel, PoolHandle, TxOptions};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use sqlx::{Postgres, Sqlite};
use std::future::Future;
use tracing::{debug, error};

/// Where a statement runs: on the ambient transaction's connection, or on the
/// pool directly.
pub enum Statement<'c, P: PoolHandle> {
    Transaction(&'c mut ConnectionOf<P>),
    Pool(&'c P),
}

impl<P: PoolHandle> Statement<'_, P> {
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }
}

impl<P: PoolHandle> std::fmt::Debug for Statement<'_, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transaction(_) => f.write_str("Statement::Transaction"),
            Self::Pool(_) => f.write_str("Statement::Pool"),
        }
    }
}

/// Query helpers dispatching on the statement target for one sqlx backend.
macro_rules! impl_statement_queries {
    ($db:ty, $pool:ty, $row:ty, $result:ty) => {
        impl Statement<'_, $pool> {
            pub async fn execute<'q>(
                &mut self,
                query: sqlx::query::Query<'q, $db, <$db as sqlx::Database>::Arguments<'q>>,
            ) -> DbResult<$result> {
                let result = match self {
                    Self::Transaction(conn) => query.execute(&mut **conn).await,
                    Self::Pool(pool) => query.execute(*pool).await,
                };
                Ok(result?)
            }

            pub async fn fetch_all<'q>(
                &mut self,
                query: sqlx::query::Query<'q, $db, <$db as sqlx::Database>::Arguments<'q>>,
            ) -> DbResult<Vec<$row>> {
                let rows = match self {
                    Self::Transaction(conn) => query.fetch_all(&mut **conn).await,
                    Self::Pool(pool) => query.fetch_all(*pool).await,
                };
                Ok(rows?)
            }

            pub async fn fetch_optional<'q>(
                &mut self,
                query: sqlx::query::Query<'q, $db, <$db as sqlx::Database>::Arguments<'q>>,
            ) -> DbResult<Option<$row>> {
                let row = match self {
                    Self::Transaction(conn) => query.fetch_optional(&mut **conn).await,
                    Self::Pool(pool) => query.fetch_optional(*pool).await,
                };
                Ok(row?)
            }

            /// Fails with [`DbError::NotFound`] when the query returns no rows.
            pub async fn fetch_one<'q>(
                &mut self,
                query: sqlx::query::Query<'q, $db, <$db as sqlx::Database>::Arguments<'q>>,
            ) -> DbResult<$row> {
                let row = match self {
                    Self::Transaction(conn) => query.fetch_one(&mut **conn).await,
                    Self::Pool(pool) => query.fetch_one(*pool).await,
                };
                Ok(row?)
            }
        }
    };
}

impl_statement_queries!(
    Postgres,
    sqlx::PgPool,
    sqlx::postgres::PgRow,
    sqlx::postgres::PgQueryResult
);
impl_statement_queries!(
    Sqlite,
    sqlx::SqlitePool,
    sqlx::sqlite::SqliteRow,
    sqlx::sqlite::SqliteQueryResult
);

impl<C: Connector> ConnectionManager<C> {
    /// Begin a raw transaction on the current pool. The caller owns it and
    /// must commit or roll it back.
    pub async fn begin_tx(
        &self,
        ctx: &Context<C::Pool>,
        options: TxOptions,
    ) -> DbResult<<C::Pool as PoolHandle>::Transaction> {
        let pool = self.pool().await?;
        ctx.run("begin transaction", pool.begin(options)).await
    }

    /// Run `work` inside a new transaction with `options`.
    ///
    /// `work` receives a child of `ctx` with the transaction installed as
    /// ambient. On `Ok` the transaction commits and a commit failure is
    /// returned. On `Err` it rolls back; if the rollback itself fails, that
    /// error is returned instead of the callback's. A transaction already
    /// ambient in `ctx` is shadowed, not joined.
    pub async fn run_in_tx<T, E, F, Fut>(
        &self,
        ctx: &Context<C::Pool>,
        options: TxOptions,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context<C::Pool>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + std::fmt::Display,
    {
        let transaction = self.begin_tx(ctx, options).await?;
        let ambient = AmbientTransaction::new(transaction, options);

        match work(ctx.with_transaction(ambient.clone())).await {
            Ok(value) => {
                ambient.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(
                    component = COMPONENT,
                    transaction_id = %ambient.id(),
                    error = %err,
                    "Transaction callback failed, rolling back"
                );
                if let Err(rollback_err) = ambient.rollback().await {
                    error!(
                        component = COMPONENT,
                        transaction_id = %ambient.id(),
                        error = %err,
                        rollback_error = %rollback_err,
                        "Unable to roll back after callback error"
                    );
                    return Err(rollback_err.into());
                }
                Err(err)
            }
        }
    }

    /// [`run_in_tx`](Self::run_in_tx) with the server's default isolation
    /// (READ COMMITTED on PostgreSQL), read-write.
    pub async fn run_in_read_committed_tx<T, E, F, Fut>(
        &self,
        ctx: &Context<C::Pool>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context<C::Pool>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + std::fmt::Display,
    {
        self.run_in_tx(ctx, TxOptions::default(), work).await
    }

    /// [`run_in_tx`](Self::run_in_tx) at READ UNCOMMITTED, read-write.
    pub async fn run_in_read_uncommitted_tx<T, E, F, Fut>(
        &self,
        ctx: &Context<C::Pool>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context<C::Pool>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError> + std::fmt::Display,
    {
        let options = TxOptions::with_isolation(IsolationLevel::ReadUncommitted);
        self.run_in_tx(ctx, options, work).await
    }

    /// Begin a transaction and return a child of `ctx` carrying it.
    pub async fn begin_contextual(&self, ctx: &Context<C::Pool>) -> DbResult<Context<C::Pool>> {
        let options = TxOptions::default();
        let transaction = self.begin_tx(ctx, options).await?;
        Ok(ctx.with_transaction(AmbientTransaction::new(transaction, options)))
    }

    /// Commit the transaction ambient in `ctx`.
    pub async fn commit_contextual(&self, ctx: &Context<C::Pool>) -> DbResult<()> {
        ctx.transaction()
            .ok_or(DbError::NotInTransaction)?
            .commit()
            .await
    }

    /// Roll back the transaction ambient in `ctx`.
    pub async fn rollback_contextual(&self, ctx: &Context<C::Pool>) -> DbResult<()> {
        ctx.transaction()
            .ok_or(DbError::NotInTransaction)?
            .rollback()
            .await
    }

    /// Run `work` on the ambient transaction if `ctx` has one, otherwise on
    /// the pool.
    pub async fn try_with_transaction<T, E, F>(
        &self,
        ctx: &Context<C::Pool>,
        work: F,
    ) -> Result<T, E>
    where
        F: for<'c> FnOnce(Statement<'c, C::Pool>) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        match ctx.transaction() {
            Some(ambient) => {
                ctx.run(
                    "transactional statement",
                    ambient.with_connection(|conn| work(Statement::Transaction(conn))),
                )
                .await
            }
            None => {
                let pool = self.pool().await?;
                ctx.run("statement", work(Statement::Pool(&pool))).await
            }
        }
    }

    /// Run `work` on the ambient transaction's connection.
    ///
    /// Fails with [`DbError::NoTransactionInContext`] without calling `work`
    /// when `ctx` carries no transaction.
    pub async fn must_with_transaction<T, E, F>(
        &self,
        ctx: &Context<C::Pool>,
        work: F,
    ) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut ConnectionOf<C::Pool>) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let ambient = ctx
            .transaction()
            .ok_or(DbError::NoTransactionInContext)?;
        ctx.run("transactional statement", ambient.with_connection(work))
            .await
    }
}
