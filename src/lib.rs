//! PostgreSQL connection lifecycle management.
//!
//! Establishes a pooled connection with configurable retry, exposes health
//! checks and shutdown, and propagates an ambient transaction through an
//! explicit [`Context`] so data-access helpers can join it without extra
//! parameters.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;

pub use config::{DatabaseSettings, DbConfig, TlsMode};
pub use db::{ConnectionManager, Context, Statement, TxOptions};
pub use error::{DbError, DbResult};
