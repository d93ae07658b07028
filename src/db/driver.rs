//! Driver seam between the connection manager and sqlx.
//!
//! The manager and the transaction propagator only talk to these traits:
//! - [`Connector`] opens a new pool from [`ConnectionParams`]
//! - [`PoolHandle`] is the live pooled handle (ping, probe, begin, close)
//! - [`TransactionHandle`] is one open transaction bound to one connection
//!
//! sqlx PostgreSQL and SQLite pools implement them below; tests plug in stubs.

use crate::config::ConnectionParams;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::Connection as _;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Sqlite};
use std::time::Duration;
use tracing::debug;

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Options applied when a transaction begins.
///
/// The default keeps the server's default isolation level in read-write mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        Self {
            isolation: Some(isolation),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// `SET TRANSACTION` statement for PostgreSQL, `None` for default options.
    pub fn postgres_statement(&self) -> Option<String> {
        if self.is_default() {
            return None;
        }
        let access = if self.read_only {
            "READ ONLY"
        } else {
            "READ WRITE"
        };
        Some(match self.isolation {
            Some(level) => format!("SET TRANSACTION ISOLATION LEVEL {}, {}", level, access),
            None => format!("SET TRANSACTION {}", access),
        })
    }
}

/// Creates pools. One call is one connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Pool: PoolHandle;

    /// Open a pool with the configured limits applied.
    async fn open(&self, params: &ConnectionParams) -> DbResult<Self::Pool>;
}

/// A live pooled connection handle.
#[async_trait]
pub trait PoolHandle: Clone + Send + Sync + 'static {
    type Transaction: TransactionHandle;

    /// Lightweight liveness round trip.
    async fn ping(&self) -> DbResult<()>;

    /// Run `SELECT 1` and drain its rows.
    async fn probe(&self) -> DbResult<()>;

    async fn begin(&self, options: TxOptions) -> DbResult<Self::Transaction>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Connection type statements run on inside a transaction of pool `P`.
pub type ConnectionOf<P> = <<P as PoolHandle>::Transaction as TransactionHandle>::Connection;

/// An open transaction. Consumed by exactly one of commit or rollback.
#[async_trait]
pub trait TransactionHandle: Send + 'static {
    type Connection: Send;

    fn connection(&mut self) -> &mut Self::Connection;

    async fn commit(self) -> DbResult<()>;

    async fn rollback(self) -> DbResult<()>;
}

/// How long surplus idle connections live when the idle limit is below the
/// open limit.
pub const IDLE_TRIM_TIMEOUT: Duration = Duration::from_secs(1);

/// Production connector: builds a [`PgPool`] from the captured parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl PgConnector {
    /// Pool limits derived from the parameters.
    ///
    /// sqlx has no cap on idle connections, only a floor (`min_connections`).
    /// The floor stays at 0 and an idle limit below the open limit is
    /// approximated by closing idle connections after [`IDLE_TRIM_TIMEOUT`].
    pub fn pool_options(params: &ConnectionParams) -> PgPoolOptions {
        let max_open = params.max_open_connections().max(1);
        let options = PgPoolOptions::new()
            .max_connections(max_open)
            .min_connections(0);

        if params.max_idle_connections() < max_open {
            options.idle_timeout(IDLE_TRIM_TIMEOUT)
        } else {
            options
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Pool = PgPool;

    async fn open(&self, params: &ConnectionParams) -> DbResult<PgPool> {
        let pool = Self::pool_options(params)
            .connect_with(params.connect_options())
            .await?;
        Ok(pool)
    }
}

/// Implements [`PoolHandle`] and [`TransactionHandle`] for a concrete sqlx backend.
///
/// `$set_tx` maps [`TxOptions`] to the statement that configures the freshly
/// begun transaction, or `None` when the backend has nothing to apply.
macro_rules! impl_sqlx_handles {
    ($db:ty, $conn:ty, $set_tx:expr) => {
        #[async_trait]
        impl PoolHandle for sqlx::Pool<$db> {
            type Transaction = sqlx::Transaction<'static, $db>;

            async fn ping(&self) -> DbResult<()> {
                let mut conn = self.acquire().await?;
                conn.ping().await?;
                Ok(())
            }

            async fn probe(&self) -> DbResult<()> {
                let mut rows = sqlx::query("SELECT 1").fetch(self);
                while rows.try_next().await?.is_some() {}
                Ok(())
            }

            async fn begin(&self, options: TxOptions) -> DbResult<Self::Transaction> {
                let mut tx = sqlx::Pool::begin(self).await?;
                let set_tx: fn(&TxOptions) -> Option<String> = $set_tx;
                if let Some(statement) = set_tx(&options) {
                    debug!(statement = %statement, "Configuring transaction");
                    sqlx::query(&statement).execute(&mut *tx).await?;
                }
                Ok(tx)
            }

            async fn close(&self) {
                sqlx::Pool::close(self).await
            }

            fn is_closed(&self) -> bool {
                sqlx::Pool::is_closed(self)
            }
        }

        #[async_trait]
        impl TransactionHandle for sqlx::Transaction<'static, $db> {
            type Connection = $conn;

            fn connection(&mut self) -> &mut $conn {
                &mut **self
            }

            async fn commit(self) -> DbResult<()> {
                sqlx::Transaction::commit(self).await.map_err(DbError::from)
            }

            async fn rollback(self) -> DbResult<()> {
                sqlx::Transaction::rollback(self)
                    .await
                    .map_err(DbError::from)
            }
        }
    };
}

impl_sqlx_handles!(Postgres, sqlx::PgConnection, |options| {
    options.postgres_statement()
});

// SQLite transactions are serializable; only the default options are meaningful.
impl_sqlx_handles!(Sqlite, sqlx::SqliteConnection, |_| None);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;

    fn params(max_open: u32, max_idle: u32) -> ConnectionParams {
        ConnectionParams::capture(&DbConfig {
            max_open_connections: max_open,
            max_idle_connections: max_idle,
            ..DbConfig::default()
        })
    }

    #[test]
    fn test_pool_options_never_keep_a_floor() {
        let options = PgConnector::pool_options(&params(8, 8));
        assert_eq!(options.get_max_connections(), 8);
        assert_eq!(options.get_min_connections(), 0);
        assert_ne!(options.get_idle_timeout(), Some(IDLE_TRIM_TIMEOUT));
    }

    #[test]
    fn test_pool_options_trim_idle_below_open_limit() {
        let none_idle = PgConnector::pool_options(&params(8, 0));
        assert_eq!(none_idle.get_min_connections(), 0);
        assert_eq!(none_idle.get_idle_timeout(), Some(IDLE_TRIM_TIMEOUT));

        let some_idle = PgConnector::pool_options(&params(8, 2));
        assert_eq!(some_idle.get_min_connections(), 0);
        assert_eq!(some_idle.get_idle_timeout(), Some(IDLE_TRIM_TIMEOUT));
    }

    #[test]
    fn test_pool_options_open_limit_at_least_one() {
        let options = PgConnector::pool_options(&params(0, 0));
        assert_eq!(options.get_max_connections(), 1);
    }

    #[test]
    fn test_default_options_have_no_statement() {
        assert!(TxOptions::default().is_default());
        assert_eq!(TxOptions::default().postgres_statement(), None);
    }

    #[test]
    fn test_read_uncommitted_statement() {
        let options = TxOptions::with_isolation(IsolationLevel::ReadUncommitted);
        assert_eq!(
            options.postgres_statement().as_deref(),
            Some("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED, READ WRITE")
        );
    }

    #[test]
    fn test_read_only_statement_without_isolation() {
        let options = TxOptions::default().read_only();
        assert_eq!(
            options.postgres_statement().as_deref(),
            Some("SET TRANSACTION READ ONLY")
        );
    }

    #[test]
    fn test_serializable_read_only_statement() {
        let options = TxOptions::with_isolation(IsolationLevel::Serializable).read_only();
        assert_eq!(
            options.postgres_statement().as_deref(),
            Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY")
        );
    }
}
