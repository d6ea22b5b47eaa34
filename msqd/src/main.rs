//! MSQ Daemon
//!
//! Runtime orchestrator for the command execution engine and API server.
//!
//! # Usage
//!
//! ```bash
//! # Start with default configuration (in-memory store, stub exchange)
//! cargo run -p msqd
//!
//! # Start against PostgreSQL
//! DATABASE_URL=postgres://... cargo run -p msqd --features postgres
//!
//! # Database lifecycle
//! cargo run -p msqd --features postgres -- db migrate
//! ```
//!
//! # Environment Variables
//!
//! - `MSQ_ENV`: Environment (test, development, production)
//! - `MSQ_API_HOST`: API host (default: 0.0.0.0)
//! - `MSQ_API_PORT`: API port (default: 8080)
//! - `DATABASE_URL`: PostgreSQL URL (postgres feature)
//! - `MSQ_EXCHANGE_ID` / `MSQ_CONNECTOR_ID`: connector identity (default: 1 / 1)
//! - `MSQ_DISPATCHER_POOL_SIZE`: dispatcher workers (default: 8)
//! - `MSQ_DUMPER_POOL_SIZE`: dumper workers (default: 4)
//! - `MSQ_RECOVERY_STALENESS_SECS`, `MSQ_EXECUTION_WINDOW_SECS`, `MSQ_CLAIM_GRACE_MS`,
//!   `MSQ_POLL_INTERVAL_MS`, `MSQ_STORE_ERROR_BACKOFF_SECS`, `MSQ_TIMEOUTER_INTERVAL_MS`,
//!   `MSQ_TIMEOUTER_BATCH_SIZE`

use msqd::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("msqd=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("db") {
        #[cfg(feature = "postgres")]
        return msqd::db::run_db_command(args).await;
        #[cfg(not(feature = "postgres"))]
        anyhow::bail!("db commands require the `postgres` feature");
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        "MSQ Daemon"
    );

    run(config).await
}

#[cfg(feature = "postgres")]
async fn run(config: Config) -> anyhow::Result<()> {
    if config.database_url.is_some() {
        let exchange = std::sync::Arc::new(msq_exec::StubExchange::new(
            rust_decimal_macros::dec!(95000),
        ));
        Daemon::connect(config, exchange).await?.run().await?;
    } else {
        tracing::warn!("DATABASE_URL not set, using the in-memory store");
        Daemon::new_stub(config)?.run().await?;
    }
    Ok(())
}

#[cfg(not(feature = "postgres"))]
async fn run(config: Config) -> anyhow::Result<()> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL ignored: built without the `postgres` feature");
    }
    Daemon::new_stub(config)?.run().await?;
    Ok(())
}
