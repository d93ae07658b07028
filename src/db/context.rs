//! Request-scoped execution context.
//!
//! A [`Context`] is threaded explicitly through call signatures. It carries:
//! - an optional deadline
//! - zero or more cancellation signals inherited from its ancestors
//! - an optional [`AmbientTransaction`] that statements in this call subtree
//!   may opt into
//!
//! Deriving a child never mutates the parent, so the ambient transaction is
//! visible only to code that received a context derived from the one it was
//! installed into. Contexts built from different roots never see each other's
//! transactions.

use crate::db::driver::{PoolHandle, TransactionHandle, TxOptions};
use crate::error::{DbError, DbResult};
use futures_util::future::{BoxFuture, select_all};
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Lifecycle of a transaction. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

enum Slot<T> {
    Open(T),
    Terminated(TransactionState),
}

struct Shared<T> {
    id: String,
    options: TxOptions,
    started_at: Instant,
    slot: Mutex<Slot<T>>,
}

tokio::task_local! {
    /// Ids of the transactions whose connection the current task is using.
    static CONNECTIONS_IN_USE: Vec<String>;
}

/// A transaction shared by every clone of the context it was installed into.
///
/// The underlying handle sits behind an async mutex; statements issued through
/// one ambient transaction are serialized on its single connection. A task
/// that already holds the connection and asks for it again gets
/// [`DbError::TransactionBusy`] instead of waiting on itself.
pub struct AmbientTransaction<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AmbientTransaction<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for AmbientTransaction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientTransaction")
            .field("id", &self.shared.id)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl<T: TransactionHandle> AmbientTransaction<T> {
    pub fn new(transaction: T, options: TxOptions) -> Self {
        let id = generate_transaction_id();
        debug!(transaction_id = %id, ?options, "Transaction started");
        Self {
            shared: Arc::new(Shared {
                id,
                options,
                started_at: Instant::now(),
                slot: Mutex::new(Slot::Open(transaction)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn options(&self) -> TxOptions {
        self.shared.options
    }

    pub fn elapsed(&self) -> Duration {
        self.shared.started_at.elapsed()
    }

    pub async fn state(&self) -> TransactionState {
        // The connection can only be held while the slot is open.
        if self.is_held_by_current_task() {
            return TransactionState::Open;
        }
        match &*self.shared.slot.lock().await {
            Slot::Open(_) => TransactionState::Open,
            Slot::Terminated(state) => *state,
        }
    }

    /// Run `work` on the transaction's connection.
    ///
    /// Fails with [`DbError::TransactionTerminated`] once the transaction has
    /// been committed or rolled back, and with [`DbError::TransactionBusy`]
    /// when called from inside another `work` on the same transaction. Other
    /// tasks wait for the connection.
    pub async fn with_connection<R, E, F>(&self, work: F) -> Result<R, E>
    where
        F: for<'c> FnOnce(&'c mut T::Connection) -> BoxFuture<'c, Result<R, E>>,
        E: From<DbError>,
    {
        let mut in_use = CONNECTIONS_IN_USE
            .try_with(|ids| ids.clone())
            .unwrap_or_default();
        if in_use.contains(&self.shared.id) {
            debug!(transaction_id = %self.shared.id, "Nested use of transaction connection");
            return Err(DbError::transaction_busy(&self.shared.id).into());
        }

        let mut slot = self.shared.slot.lock().await;
        match &mut *slot {
            Slot::Open(transaction) => {
                in_use.push(self.shared.id.clone());
                CONNECTIONS_IN_USE
                    .scope(in_use, work(transaction.connection()))
                    .await
            }
            Slot::Terminated(state) => {
                Err(DbError::transaction_terminated(&self.shared.id, *state).into())
            }
        }
    }

    pub async fn commit(&self) -> DbResult<()> {
        let transaction = self.terminate(TransactionState::Committed).await?;
        transaction.commit().await?;
        info!(
            transaction_id = %self.shared.id,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "Transaction committed"
        );
        Ok(())
    }

    pub async fn rollback(&self) -> DbResult<()> {
        let transaction = self.terminate(TransactionState::RolledBack).await?;
        if let Err(e) = transaction.rollback().await {
            error!(transaction_id = %self.shared.id, error = %e, "Rollback failed");
            return Err(e);
        }
        info!(
            transaction_id = %self.shared.id,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "Transaction rolled back"
        );
        Ok(())
    }

    /// Move the slot to a terminal state and hand back the open handle.
    ///
    /// The state changes before the driver call so a failed commit or
    /// rollback still leaves the transaction terminal.
    async fn terminate(&self, next: TransactionState) -> DbResult<T> {
        if self.is_held_by_current_task() {
            return Err(DbError::transaction_busy(&self.shared.id));
        }
        let mut slot = self.shared.slot.lock().await;
        match std::mem::replace(&mut *slot, Slot::Terminated(next)) {
            Slot::Open(transaction) => Ok(transaction),
            Slot::Terminated(state) => {
                *slot = Slot::Terminated(state);
                Err(DbError::transaction_terminated(&self.shared.id, state))
            }
        }
    }

    fn is_held_by_current_task(&self) -> bool {
        CONNECTIONS_IN_USE
            .try_with(|ids| ids.contains(&self.shared.id))
            .unwrap_or(false)
    }
}

/// Cancels every context derived from the one returned alongside it.
///
/// Dropping the handle without calling [`cancel`](Self::cancel) leaves the
/// contexts running.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

/// Execution context passed down a call tree.
pub struct Context<P: PoolHandle> {
    ambient: Option<AmbientTransaction<P::Transaction>>,
    deadline: Option<Instant>,
    cancellations: Vec<watch::Receiver<bool>>,
}

impl<P: PoolHandle> Clone for Context<P> {
    fn clone(&self) -> Self {
        Self {
            ambient: self.ambient.clone(),
            deadline: self.deadline,
            cancellations: self.cancellations.clone(),
        }
    }
}

impl<P: PoolHandle> std::fmt::Debug for Context<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("transaction", &self.ambient.as_ref().map(|tx| tx.id()))
            .field("deadline", &self.deadline)
            .field("cancellations", &self.cancellations.len())
            .finish()
    }
}

impl<P: PoolHandle> Default for Context<P> {
    fn default() -> Self {
        Self::background()
    }
}

impl<P: PoolHandle> Context<P> {
    /// Root context: no transaction, no deadline, never cancelled.
    pub fn background() -> Self {
        Self {
            ambient: None,
            deadline: None,
            cancellations: Vec::new(),
        }
    }

    /// Child context that expires `timeout` from now, or at the parent's
    /// deadline if that is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.clone();
        child.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        child
    }

    /// Child context that is cancelled when the returned handle fires or
    /// when any ancestor is cancelled.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let mut child = self.clone();
        child.cancellations.push(receiver);
        (child, CancelHandle { sender })
    }

    /// Child context with `transaction` installed as ambient, replacing any
    /// transaction inherited from the parent.
    pub fn with_transaction(&self, transaction: AmbientTransaction<P::Transaction>) -> Self {
        let mut child = self.clone();
        child.ambient = Some(transaction);
        child
    }

    /// Child context with the ambient transaction removed.
    pub fn without_transaction(&self) -> Self {
        let mut child = self.clone();
        child.ambient = None;
        child
    }

    pub fn transaction(&self) -> Option<&AmbientTransaction<P::Transaction>> {
        self.ambient.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.ambient.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellations.iter().any(|rx| *rx.borrow())
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    /// Resolves when any cancellation signal fires. Never resolves for a
    /// context without signals.
    pub async fn cancelled(&self) {
        if self.cancellations.is_empty() {
            return pending().await;
        }
        let waits = self.cancellations.iter().cloned().map(|mut rx| {
            Box::pin(async move {
                let fired = rx.wait_for(|cancelled| *cancelled).await.is_ok();
                if !fired {
                    // Sender dropped without cancelling.
                    pending::<()>().await;
                }
            })
        });
        select_all(waits).await;
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => pending().await,
        }
    }

    /// Drive `operation` unless the context is cancelled or its deadline
    /// passes first, in which case the operation is dropped.
    pub async fn run<T, E, F>(&self, operation: &str, future: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if self.is_cancelled() {
            return Err(DbError::cancelled(operation).into());
        }
        if self.is_expired() {
            return Err(DbError::timeout(operation).into());
        }
        tokio::select! {
            result = future => result,
            _ = self.cancelled() => Err(DbError::cancelled(operation).into()),
            _ = self.expired() => Err(DbError::timeout(operation).into()),
        }
    }

    /// Sleep for `duration`, waking early with an error on cancellation or
    /// deadline expiry.
    pub async fn sleep(&self, duration: Duration) -> DbResult<()> {
        self.run("sleep", async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
