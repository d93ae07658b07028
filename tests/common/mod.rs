//! Scriptable in-memory driver for exercising the manager without a server.

#![allow(dead_code)]

use async_trait::async_trait;
use pg_lifecycle::config::{ConnectionParams, DbConfig};
use pg_lifecycle::db::{Connector, PoolHandle, TransactionHandle, TxOptions};
use pg_lifecycle::{DbError, DbResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared knobs and counters. Flip the atomics mid-test to change behavior.
#[derive(Debug, Default)]
pub struct StubBehavior {
    /// Number of initial `open` calls that fail. `u64::MAX` fails forever.
    pub failing_opens: AtomicU64,
    pub fail_ping: AtomicBool,
    pub fail_probe: AtomicBool,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub attempts: AtomicU64,
    pub closed_pools: AtomicU64,
    pub events: Mutex<Vec<String>>,
}

impl StubBehavior {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(opens: u64) -> Arc<Self> {
        let behavior = Self::default();
        behavior.failing_opens.store(opens, Ordering::SeqCst);
        Arc::new(behavior)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn closed_pools(&self) -> u64 {
        self.closed_pools.load(Ordering::SeqCst)
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }
}

#[derive(Debug, Clone)]
pub struct StubConnector {
    pub behavior: Arc<StubBehavior>,
}

impl StubConnector {
    pub fn new(behavior: &Arc<StubBehavior>) -> Self {
        Self {
            behavior: Arc::clone(behavior),
        }
    }
}

#[async_trait]
impl Connector for StubConnector {
    type Pool = StubPool;

    async fn open(&self, _params: &ConnectionParams) -> DbResult<StubPool> {
        let attempt = self.behavior.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.behavior.failing_opens.load(Ordering::SeqCst) {
            return Err(DbError::connection(
                "connection refused",
                "Check that the server is running",
            ));
        }
        Ok(StubPool {
            id: attempt,
            behavior: Arc::clone(&self.behavior),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StubPool {
    pub id: u64,
    behavior: Arc<StubBehavior>,
    closed: Arc<AtomicBool>,
}

impl StubPool {
    /// Statement issued outside any transaction.
    pub fn exec(&self, sql: &str) {
        self.behavior.record(format!("pool:{}", sql));
    }
}

#[async_trait]
impl PoolHandle for StubPool {
    type Transaction = StubTx;

    async fn ping(&self) -> DbResult<()> {
        if self.behavior.fail_ping.load(Ordering::SeqCst) {
            return Err(DbError::connection("ping failed", "Check the server"));
        }
        Ok(())
    }

    async fn probe(&self) -> DbResult<()> {
        if self.behavior.fail_probe.load(Ordering::SeqCst) {
            return Err(DbError::database("probe failed", None, "Check the server"));
        }
        Ok(())
    }

    async fn begin(&self, options: TxOptions) -> DbResult<StubTx> {
        if self.behavior.fail_begin.load(Ordering::SeqCst) {
            return Err(DbError::connection("begin failed", "Check the server"));
        }
        let isolation = options
            .isolation
            .map(|level| level.to_string())
            .unwrap_or_else(|| "DEFAULT".to_string());
        self.behavior.record(format!("begin:{}", isolation));
        Ok(StubTx {
            conn: StubConn {
                behavior: Arc::clone(&self.behavior),
            },
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.behavior.closed_pools.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct StubConn {
    behavior: Arc<StubBehavior>,
}

impl StubConn {
    /// Statement issued on a transaction's connection.
    pub fn exec(&mut self, sql: &str) {
        self.behavior.record(format!("tx:{}", sql));
    }
}

#[derive(Debug)]
pub struct StubTx {
    conn: StubConn,
}

#[async_trait]
impl TransactionHandle for StubTx {
    type Connection = StubConn;

    fn connection(&mut self) -> &mut StubConn {
        &mut self.conn
    }

    async fn commit(self) -> DbResult<()> {
        if self.conn.behavior.fail_commit.load(Ordering::SeqCst) {
            self.conn.behavior.record("commit_failed");
            return Err(DbError::connection("commit failed", "Retry the transaction"));
        }
        self.conn.behavior.record("commit");
        Ok(())
    }

    async fn rollback(self) -> DbResult<()> {
        if self.conn.behavior.fail_rollback.load(Ordering::SeqCst) {
            self.conn.behavior.record("rollback_failed");
            return Err(DbError::connection("rollback failed", "Check the server"));
        }
        self.conn.behavior.record("rollback");
        Ok(())
    }
}

/// Configuration with the given retry settings and defaults elsewhere.
pub fn config(retry_count: u32, retry_delay_ms: u64) -> DbConfig {
    DbConfig {
        retry_count,
        retry_delay_ms,
        ..DbConfig::default()
    }
}
