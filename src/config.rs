//! Configuration handling for the PostgreSQL connection manager.
//!
//! [`DbConfig`] is loaded from environment variables (or CLI-style arguments)
//! via clap. The manager never reads it directly: it consumes the
//! [`DatabaseSettings`] capability and captures an immutable
//! [`ConnectionParams`] snapshot at construction time.

use crate::db::retry::RetryPolicy;
use crate::error::{DbError, DbResult};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use sqlx::ConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::time::Duration;

pub const DEFAULT_DB_HOST: &str = "localhost";
pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_DB_NAME: &str = "postgres";
pub const DEFAULT_DB_USER: &str = "postgres";

// Pool configuration defaults
pub const DEFAULT_MAX_OPEN_CONNECTIONS: u32 = 8;
pub const DEFAULT_MAX_IDLE_CONNECTIONS: u32 = 8;

/// 0 retries forever.
pub const DEFAULT_RETRY_COUNT: u32 = 0;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;

/// libpq `sslmode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TlsMode> for PgSslMode {
    fn from(mode: TlsMode) -> Self {
        match mode {
            TlsMode::Disable => PgSslMode::Disable,
            TlsMode::Allow => PgSslMode::Allow,
            TlsMode::Prefer => PgSslMode::Prefer,
            TlsMode::Require => PgSslMode::Require,
            TlsMode::VerifyCa => PgSslMode::VerifyCa,
            TlsMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

/// Read-only view of the settings the connection manager needs.
///
/// Implemented by [`DbConfig`]; hosting applications with their own
/// configuration machinery can implement it instead.
pub trait DatabaseSettings {
    fn host(&self) -> &str;
    fn port(&self) -> u16;
    fn database(&self) -> &str;
    fn user(&self) -> &str;
    fn password(&self) -> &str;
    fn tls_mode(&self) -> TlsMode;
    fn max_open_connections(&self) -> u32;
    fn max_idle_connections(&self) -> u32;
    /// Maximum number of connection attempts. 0 means retry forever.
    fn retry_count(&self) -> u32;
    /// Pause between connection attempts.
    fn retry_delay(&self) -> Duration;
    fn is_debug(&self) -> bool;
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "postgres",
    about = "PostgreSQL connection settings",
    no_binary_name = true
)]
pub struct DbConfig {
    /// Database server host
    #[arg(
        long = "db-host",
        default_value = DEFAULT_DB_HOST,
        env = "POSTGRESQL_SERVICE_HOST"
    )]
    pub host: String,

    /// Database server port
    #[arg(
        long = "db-port",
        default_value_t = DEFAULT_DB_PORT,
        env = "POSTGRESQL_SERVICE_PORT"
    )]
    pub port: u16,

    /// Database name
    #[arg(
        long = "db-name",
        default_value = DEFAULT_DB_NAME,
        env = "POSTGRESQL_DATABASE_NAME"
    )]
    pub database: String,

    /// Username
    #[arg(
        long = "db-user",
        default_value = DEFAULT_DB_USER,
        env = "POSTGRESQL_USERNAME"
    )]
    pub user: String,

    /// Password (sensitive - never logged or serialized)
    #[arg(
        long = "db-password",
        default_value = "",
        env = "POSTGRESQL_PASSWORD",
        hide_env_values = true
    )]
    #[serde(default, skip_serializing)]
    pub password: String,

    /// TLS negotiation mode (libpq sslmode)
    #[arg(
        long = "db-ssl-mode",
        value_enum,
        default_value_t = TlsMode::Prefer,
        env = "POSTGRESQL_SSL_MODE"
    )]
    #[serde(default)]
    pub tls_mode: TlsMode,

    /// Maximum number of open connections in the pool
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_OPEN_CONNECTIONS,
        env = "POSTGRESQL_MAX_OPEN_CONNECTIONS"
    )]
    pub max_open_connections: u32,

    /// Maximum number of idle connections kept warm
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_IDLE_CONNECTIONS,
        env = "POSTGRESQL_MAX_IDLE_CONNECTIONS"
    )]
    pub max_idle_connections: u32,

    /// Maximum number of connection attempts. If 0 - infinite loop
    #[arg(
        long,
        default_value_t = DEFAULT_RETRY_COUNT,
        env = "POSTGRESQL_CONNECTION_RETRY_COUNT"
    )]
    pub retry_count: u32,

    /// Delay in milliseconds between connection attempts
    #[arg(
        long,
        default_value_t = DEFAULT_RETRY_DELAY_MS,
        env = "POSTGRESQL_CONNECTION_RETRY_TIMEOUT"
    )]
    pub retry_delay_ms: u64,

    /// Enable driver statement logging
    #[arg(long = "db-debug", env = "POSTGRESQL_DEBUG")]
    #[serde(default)]
    pub debug: bool,
}

impl DbConfig {
    /// Load the configuration from `POSTGRESQL_*` environment variables and validate it.
    pub fn from_env() -> DbResult<Self> {
        let config = Self::try_parse_from(std::iter::empty::<String>())
            .map_err(|e| DbError::invalid_config(e.to_string()))?;
        config.validate().map_err(DbError::invalid_config)?;
        Ok(config)
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            database: DEFAULT_DB_NAME.to_string(),
            user: DEFAULT_DB_USER.to_string(),
            password: String::new(),
            tls_mode: TlsMode::default(),
            max_open_connections: DEFAULT_MAX_OPEN_CONNECTIONS,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            debug: false,
        }
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.max_open_connections == 0 {
            return Err("max_open_connections must be greater than 0".to_string());
        }
        if self.max_idle_connections > self.max_open_connections {
            return Err(format!(
                "max_idle_connections ({}) cannot exceed max_open_connections ({})",
                self.max_idle_connections, self.max_open_connections
            ));
        }
        Ok(())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl DatabaseSettings for DbConfig {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn password(&self) -> &str {
        &self.password
    }

    fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    fn max_open_connections(&self) -> u32 {
        self.max_open_connections
    }

    fn max_idle_connections(&self) -> u32 {
        self.max_idle_connections
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    fn is_debug(&self) -> bool {
        self.debug
    }
}

/// Immutable snapshot of the connection settings, captured when a manager is
/// constructed. A configuration change requires a new manager.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
    tls_mode: TlsMode,
    max_open_connections: u32,
    max_idle_connections: u32,
    retry_count: u32,
    retry_delay: Duration,
    debug: bool,
}

impl ConnectionParams {
    pub fn capture(settings: &impl DatabaseSettings) -> Self {
        Self {
            host: settings.host().to_string(),
            port: settings.port(),
            user: settings.user().to_string(),
            password: settings.password().to_string(),
            database: settings.database().to_string(),
            tls_mode: settings.tls_mode(),
            max_open_connections: settings.max_open_connections(),
            max_idle_connections: settings.max_idle_connections(),
            retry_count: settings.retry_count(),
            retry_delay: settings.retry_delay(),
            debug: settings.is_debug(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    pub fn max_open_connections(&self) -> u32 {
        self.max_open_connections
    }

    pub fn max_idle_connections(&self) -> u32 {
        self.max_idle_connections
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_count, self.retry_delay)
    }

    /// Build the key/value DSN understood by libpq-compatible drivers.
    ///
    /// The manager connects through [`connect_options`](Self::connect_options)
    /// and never uses this string itself. It is exposed for external tools
    /// (`psql`, migration runners) that take a libpq DSN. It carries the
    /// password in clear; log [`redacted_dsn`](Self::redacted_dsn) instead.
    pub fn dsn(&self) -> String {
        format_dsn(
            &self.host,
            self.port,
            &self.user,
            &self.password,
            &self.database,
            self.tls_mode,
        )
    }

    /// Same as [`dsn`](Self::dsn) with the password masked, for logs.
    pub fn redacted_dsn(&self) -> String {
        let password = if self.password.is_empty() { "" } else { "*****" };
        format_dsn(
            &self.host,
            self.port,
            &self.user,
            password,
            &self.database,
            self.tls_mode,
        )
    }

    /// sqlx connect options carrying the same fields as the DSN.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(self.tls_mode.into());

        if self.debug {
            options
        } else {
            options.disable_statement_logging()
        }
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"*****")
            .field("database", &self.database)
            .field("tls_mode", &self.tls_mode)
            .field("max_open_connections", &self.max_open_connections)
            .field("max_idle_connections", &self.max_idle_connections)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("debug", &self.debug)
            .finish()
    }
}

fn format_dsn(
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    database: &str,
    tls_mode: TlsMode,
) -> String {
    format!(
        "host={} port={} user={} password={} dbname={} sslmode={}",
        host, port, user, password, database, tls_mode
    )
}
