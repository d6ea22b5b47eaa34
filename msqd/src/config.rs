//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use msq_domain::{ConnectorId, ExchangeId};
use msq_exec::dispatcher::validate_pool_size;
use std::env;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,

    /// PostgreSQL URL (`None` runs against the in-memory store)
    pub database_url: Option<String>,

    /// Connector configuration
    pub connector: ConnectorConfig,

    /// Stale command sweeper configuration
    pub timeouter: TimeouterConfig,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Deadline window given to newly ingested commands
    pub execution_window: Duration,
}

/// Connector configuration: one exchange served by one connector identity.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub exchange_id: ExchangeId,
    pub connector_id: ConnectorId,
    /// Dispatcher workers, also the in-flight capacity
    pub dispatcher_pool_size: usize,
    pub dumper_pool_size: usize,
    /// EXECUTING commands untouched for this long are recovered at startup
    pub recovery_staleness: Duration,
    /// Commands whose deadline passed less than this long ago are still
    /// claimed, then short-circuited to TIMED_OUT by the dispatcher
    pub claim_grace: Duration,
    /// Sleep when no command is eligible
    pub poll_interval: Duration,
    /// Sleep after a store error
    pub store_error_backoff: Duration,
    /// Dumper persistence retry delay
    pub dumper_retry_delay: Duration,
    /// Dumper idle store ping
    pub dumper_ping_interval: Duration,
}

/// Stale command sweeper configuration.
#[derive(Debug, Clone)]
pub struct TimeouterConfig {
    pub interval: Duration,
    pub batch_size: i64,
    pub error_backoff: Duration,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses stubs)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let environment = Self::load_environment()?;
        let api = Self::load_api_config()?;
        let connector = Self::load_connector_config()?;
        let timeouter = Self::load_timeouter_config(connector.store_error_backoff)?;
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let config = Self {
            api,
            database_url,
            connector,
            timeouter,
            environment,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                execution_window: Duration::from_secs(60),
            },
            database_url: None,
            connector: ConnectorConfig {
                exchange_id: 1,
                connector_id: 1,
                dispatcher_pool_size: 4,
                dumper_pool_size: 2,
                recovery_staleness: Duration::from_secs(30),
                claim_grace: Duration::from_secs(1),
                poll_interval: Duration::from_millis(10),
                store_error_backoff: Duration::from_millis(50),
                dumper_retry_delay: Duration::from_millis(20),
                dumper_ping_interval: Duration::from_secs(30),
            },
            timeouter: TimeouterConfig {
                interval: Duration::from_millis(50),
                batch_size: 10,
                error_backoff: Duration::from_millis(50),
            },
            environment: Environment::Test,
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns `DaemonError::Config` naming the first invalid value
    pub fn validate(&self) -> DaemonResult<()> {
        if self.connector.exchange_id < 1 {
            return Err(DaemonError::Config(format!(
                "Invalid MSQ_EXCHANGE_ID: {}. Must be >= 1",
                self.connector.exchange_id
            )));
        }
        if self.connector.connector_id < 1 {
            return Err(DaemonError::Config(format!(
                "Invalid MSQ_CONNECTOR_ID: {}. Must be >= 1",
                self.connector.connector_id
            )));
        }
        validate_pool_size("dispatcher", self.connector.dispatcher_pool_size)?;
        validate_pool_size("dumper", self.connector.dumper_pool_size)?;
        if self.timeouter.batch_size < 1 {
            return Err(DaemonError::Config(format!(
                "Invalid MSQ_TIMEOUTER_BATCH_SIZE: {}. Must be >= 1",
                self.timeouter.batch_size
            )));
        }
        for (key, value) in [
            ("MSQ_POLL_INTERVAL_MS", self.connector.poll_interval),
            ("MSQ_TIMEOUTER_INTERVAL_MS", self.timeouter.interval),
            ("MSQ_EXECUTION_WINDOW_SECS", self.api.execution_window),
        ] {
            if value.is_zero() {
                return Err(DaemonError::Config(format!("Invalid {}: must be > 0", key)));
            }
        }
        Ok(())
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("MSQ_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid MSQ_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_api_config() -> DaemonResult<ApiConfig> {
        let host = env::var("MSQ_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = Self::load_env("MSQ_API_PORT", 8080u16)?;
        let window = Self::load_env("MSQ_EXECUTION_WINDOW_SECS", 60u64)?;

        Ok(ApiConfig {
            host,
            port,
            execution_window: Duration::from_secs(window),
        })
    }

    fn load_connector_config() -> DaemonResult<ConnectorConfig> {
        Ok(ConnectorConfig {
            exchange_id: Self::load_env("MSQ_EXCHANGE_ID", 1)?,
            connector_id: Self::load_env("MSQ_CONNECTOR_ID", 1)?,
            dispatcher_pool_size: Self::load_env("MSQ_DISPATCHER_POOL_SIZE", 8)?,
            dumper_pool_size: Self::load_env("MSQ_DUMPER_POOL_SIZE", 4)?,
            recovery_staleness: Duration::from_secs(Self::load_env(
                "MSQ_RECOVERY_STALENESS_SECS",
                30,
            )?),
            claim_grace: Duration::from_millis(Self::load_env("MSQ_CLAIM_GRACE_MS", 1000)?),
            poll_interval: Duration::from_millis(Self::load_env("MSQ_POLL_INTERVAL_MS", 200)?),
            store_error_backoff: Duration::from_secs(Self::load_env(
                "MSQ_STORE_ERROR_BACKOFF_SECS",
                5,
            )?),
            dumper_retry_delay: Duration::from_secs(5),
            dumper_ping_interval: Duration::from_secs(30),
        })
    }

    fn load_timeouter_config(error_backoff: Duration) -> DaemonResult<TimeouterConfig> {
        Ok(TimeouterConfig {
            interval: Duration::from_millis(Self::load_env("MSQ_TIMEOUTER_INTERVAL_MS", 1000)?),
            batch_size: Self::load_env("MSQ_TIMEOUTER_BATCH_SIZE", 10)?,
            error_backoff,
        })
    }

    fn load_env<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
        match env::var(key) {
            Ok(val) => val
                .trim()
                .parse::<T>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                execution_window: Duration::from_secs(60),
            },
            database_url: None,
            connector: ConnectorConfig {
                exchange_id: 1,
                connector_id: 1,
                dispatcher_pool_size: 8,
                dumper_pool_size: 4,
                recovery_staleness: Duration::from_secs(30),
                claim_grace: Duration::from_secs(1),
                poll_interval: Duration::from_millis(200),
                store_error_backoff: Duration::from_secs(5),
                dumper_retry_delay: Duration::from_secs(5),
                dumper_ping_interval: Duration::from_secs(30),
            },
            timeouter: TimeouterConfig {
                interval: Duration::from_secs(1),
                batch_size: 10,
                error_backoff: Duration::from_secs(5),
            },
            environment: Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
