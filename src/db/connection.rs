//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns at most one live pool. `connect` establishes it
//! under the captured retry policy, verifying every fresh pool with a ping and
//! a `SELECT 1` probe before publishing it. The pool slot sits behind a tokio
//! `RwLock` so readers (statements, health checks) never block each other and
//! a reconnect swaps the handle atomically.

use crate::config::{ConnectionParams, DatabaseSettings};
use crate::db::context::Context;
use crate::db::driver::{Connector, PgConnector, PoolHandle};
use crate::db::retry::retry;
use crate::error::{DbError, DbResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Component name attached to lifecycle log events.
pub const COMPONENT: &str = "postgres";

pub struct ConnectionManager<C: Connector = PgConnector> {
    connector: C,
    params: ConnectionParams,
    pool: RwLock<Option<C::Pool>>,
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager<PgConnector> {
    /// Create a manager for PostgreSQL. No connection is attempted yet.
    pub fn new(settings: &impl DatabaseSettings) -> Self {
        Self::with_connector(settings, PgConnector)
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager that opens pools through `connector`.
    pub fn with_connector(settings: &impl DatabaseSettings, connector: C) -> Self {
        Self {
            connector,
            params: ConnectionParams::capture(settings),
            pool: RwLock::new(None),
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Establish the pool, retrying per the configured policy.
    ///
    /// Returns the previously held handle, if any, so the caller decides when
    /// to close it.
    pub async fn connect(&self) -> DbResult<Option<C::Pool>> {
        self.connect_with_context(&Context::background()).await
    }

    /// Like [`connect`](Self::connect), but cancellation or the deadline of
    /// `ctx` aborts both the attempts and the waits between them.
    pub async fn connect_with_context(
        &self,
        ctx: &Context<C::Pool>,
    ) -> DbResult<Option<C::Pool>> {
        let policy = self.params.retry_policy();
        info!(
            component = COMPONENT,
            dsn = %self.params.redacted_dsn(),
            max_attempts = ?policy.max_attempts(),
            retry_delay_ms = policy.delay().as_millis() as u64,
            "Connecting to database"
        );

        let pool = retry(&policy, ctx, COMPONENT, |attempt| self.try_connect(attempt)).await?;

        let previous = self.pool.write().await.replace(pool);
        info!(
            component = COMPONENT,
            dsn = %self.params.redacted_dsn(),
            replaced = previous.is_some(),
            "Connected successfully"
        );
        Ok(previous)
    }

    /// One connection attempt: open, ping, probe.
    async fn try_connect(&self, attempt: u64) -> DbResult<C::Pool> {
        debug!(component = COMPONENT, attempt, "Opening pool");
        let pool = self.connector.open(&self.params).await?;

        if let Err(e) = Self::verify(&pool).await {
            pool.close().await;
            return Err(e);
        }
        Ok(pool)
    }

    async fn verify(pool: &C::Pool) -> DbResult<()> {
        pool.ping().await?;
        pool.probe().await
    }

    /// Liveness check: ping plus `SELECT 1` on the current pool.
    ///
    /// False when no pool is held, when either check fails, or when `ctx` ends
    /// first. Never panics and never changes the held pool.
    pub async fn is_healthy(&self, ctx: &Context<C::Pool>) -> bool {
        let pool = match self.pool().await {
            Ok(pool) => pool,
            Err(_) => return false,
        };
        match ctx.run("health check", Self::verify(&pool)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(component = COMPONENT, error = %e, "Health check failed");
                false
            }
        }
    }

    /// Close and release the current pool.
    ///
    /// Errors with [`DbError::NotConnected`] when nothing is held, including a
    /// second call after a successful close.
    pub async fn close(&self) -> DbResult<()> {
        let pool = self
            .pool
            .write()
            .await
            .take()
            .ok_or_else(|| DbError::not_connected("no open connection pool to close"))?;
        pool.close().await;
        info!(component = COMPONENT, "Connection pool closed");
        Ok(())
    }

    /// Clone of the current pool handle.
    pub async fn pool(&self) -> DbResult<C::Pool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| DbError::not_connected("call connect() before using the pool"))
    }

    pub async fn is_connected(&self) -> bool {
        self.pool
            .read()
            .await
            .as_ref()
            .is_some_and(|pool| !pool.is_closed())
    }
}
