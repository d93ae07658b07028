//! Database layer.
//!
//! - Connection lifecycle with retry (`connection`, `retry`)
//! - Request contexts carrying cancellation and an ambient transaction (`context`)
//! - Scoped and contextual transaction helpers (`transaction`)
//! - The driver seam over sqlx pools (`driver`)

pub mod connection;
pub mod context;
pub mod driver;
pub mod retry;
pub mod transaction;
pub mod util;

pub use connection::{COMPONENT, ConnectionManager};
pub use context::{AmbientTransaction, CancelHandle, Context, TransactionState};
pub use driver::{
    ConnectionOf, Connector, IsolationLevel, PgConnector, PoolHandle, TransactionHandle,
    TxOptions,
};
pub use retry::{RetryPolicy, retry};
pub use transaction::Statement;
pub use util::{OptionalExt, empty_or_error};
