//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Dispatcher (exchange worker pool)
//! - Coordinator (claims work, recovery)
//! - Dumper (persists outcomes) and the notification sink
//! - Timeouter (expires stale commands)
//! - API Server (HTTP endpoints)
//!
//! # Lifecycle
//!
//! 1. Load configuration and dictionaries
//! 2. Spawn the pipeline, sink first, producers last
//! 3. Run until SIGINT or a fatal error in any loop
//! 4. Cancel, drain every loop, report the first error

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use msq_domain::{Dictionaries, StatusIds};
use msq_exec::{Dispatcher, DispatcherConfig, ExchangePort, PoolStats, StubExchange};
use msq_store::{CommandStore, MemoryStore};

use crate::admission::AdmissionCounter;
use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorChannels, CoordinatorConfig};
use crate::dumper::{run_notification_sink, Dumper, DumperConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::EngineMetrics;
use crate::timeouter::Timeouter;

/// Capacity of the channel between the Dumper and the notification sink.
const NOTIFICATION_BUFFER: usize = 256;

// =============================================================================
// Stores
// =============================================================================

/// One store handle per long-lived task, so each gets its own pool.
pub struct StoreSet<S: ?Sized> {
    pub coordinator: Arc<S>,
    pub dumper: Arc<S>,
    pub timeouter: Arc<S>,
    pub api: Arc<S>,
}

impl<S: ?Sized> StoreSet<S> {
    /// Every task shares `store`
    pub fn shared(store: Arc<S>) -> Self {
        Self {
            coordinator: Arc::clone(&store),
            dumper: Arc::clone(&store),
            timeouter: Arc::clone(&store),
            api: store,
        }
    }
}

// =============================================================================
// Daemon
// =============================================================================

/// The main MSQ daemon.
pub struct Daemon<E: ExchangePort + ?Sized + 'static, S: CommandStore + ?Sized + 'static> {
    config: Config,
    exchange: Arc<E>,
    stores: StoreSet<S>,
    dictionaries: Arc<Dictionaries>,
    statuses: StatusIds,
    metrics: EngineMetrics,
}

impl Daemon<StubExchange, MemoryStore> {
    /// Create a new daemon with stub components (for testing/development).
    pub fn new_stub(config: Config) -> DaemonResult<Self> {
        let exchange = Arc::new(StubExchange::new(rust_decimal_macros::dec!(95000)));
        let store = Arc::new(MemoryStore::new());
        Self::new(config, exchange, StoreSet::shared(store), Dictionaries::builtin())
    }
}

#[cfg(feature = "postgres")]
impl<E: ExchangePort + ?Sized + 'static> Daemon<E, msq_store::PgCommandStore> {
    /// Create a daemon backed by PostgreSQL, one pool per task.
    pub async fn connect(config: Config, exchange: Arc<E>) -> DaemonResult<Self> {
        use msq_store::{connect, load_dictionaries, PgCommandStore, PoolSettings};

        let url = config
            .database_url
            .clone()
            .ok_or_else(|| DaemonError::Config("DATABASE_URL is required".to_string()))?;

        let coordinator = connect(&url, &PoolSettings::sized(2)).await?;
        let dictionaries = load_dictionaries(&coordinator).await?;
        let statuses = StatusIds::resolve(&dictionaries)?;
        info!(
            exchanges = dictionaries.exchanges().len(),
            "Dictionaries loaded"
        );

        let dumper_connections = config.connector.dumper_pool_size as u32 + 1;
        let stores = StoreSet {
            coordinator: Arc::new(PgCommandStore::new(coordinator, statuses)),
            dumper: Arc::new(PgCommandStore::new(
                connect(&url, &PoolSettings::sized(dumper_connections)).await?,
                statuses,
            )),
            timeouter: Arc::new(PgCommandStore::new(
                connect(&url, &PoolSettings::sized(2)).await?,
                statuses,
            )),
            api: Arc::new(PgCommandStore::new(
                connect(&url, &PoolSettings::default()).await?,
                statuses,
            )),
        };

        Self::new(config, exchange, stores, dictionaries)
    }
}

impl<E: ExchangePort + ?Sized + 'static, S: CommandStore + ?Sized + 'static> Daemon<E, S> {
    /// Create a new daemon with provided components.
    pub fn new(
        config: Config,
        exchange: Arc<E>,
        stores: StoreSet<S>,
        dictionaries: Dictionaries,
    ) -> DaemonResult<Self> {
        config.validate()?;
        let statuses = StatusIds::resolve(&dictionaries)?;
        let exchange_name = dictionaries.exchanges().name_by_id(config.connector.exchange_id);
        if exchange_name.is_empty() {
            return Err(DaemonError::Config(format!(
                "Exchange id {} is not in the exchange dictionary",
                config.connector.exchange_id
            )));
        }

        Ok(Self {
            config,
            exchange,
            stores,
            dictionaries: Arc::new(dictionaries),
            statuses,
            metrics: EngineMetrics::new()?,
        })
    }

    /// Metrics shared by every component
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT) or a
    /// component fails.
    pub async fn run(self) -> DaemonResult<()> {
        let stop = CancellationToken::new();
        let signal = stop.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal");
                    signal.cancel();
                },
                Err(e) => error!(error = %e, "Cannot listen for shutdown signal"),
            }
        });

        self.run_until(stop).await
    }

    /// Run until `stop` is cancelled or a component fails, then drain.
    pub async fn run_until(self, stop: CancellationToken) -> DaemonResult<()> {
        let connector = &self.config.connector;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            exchange = self.dictionaries.exchanges().name_by_id(connector.exchange_id),
            connector_id = connector.connector_id,
            "Starting MSQ daemon"
        );

        let shutdown = CancellationToken::new();

        let (request_tx, request_rx) = mpsc::channel(connector.dispatcher_pool_size);
        let (response_tx, response_rx) = mpsc::channel(connector.dispatcher_pool_size);
        let (dump_tx, dump_rx) = mpsc::channel(connector.dumper_pool_size);
        let (outcome_tx, outcome_rx) = mpsc::channel(NOTIFICATION_BUFFER);

        // Consumers first, so nothing upstream sees a closed channel
        let sink = tokio::spawn(run_notification_sink(outcome_rx));

        let dumper = Dumper::spawn(
            Arc::clone(&self.stores.dumper),
            DumperConfig::from(connector),
            dump_rx,
            outcome_tx,
            self.metrics.clone(),
            shutdown.clone(),
        )?;

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&self.exchange),
            DispatcherConfig::new(connector.dispatcher_pool_size),
            request_rx,
            response_tx,
            shutdown.clone(),
        )?;

        let coordinator = Coordinator::new(
            Arc::clone(&self.stores.coordinator),
            Arc::clone(&self.dictionaries),
            Arc::new(AdmissionCounter::new(connector.dispatcher_pool_size)),
            self.metrics.clone(),
            CoordinatorConfig::from(connector),
        );
        let channels = CoordinatorChannels {
            requests: request_tx,
            responses: response_rx,
            downstream: dump_tx,
        };
        let coordinator = tokio::spawn(coordinator.run(channels, shutdown.clone()));

        let timeouter = Timeouter::new(
            Arc::clone(&self.stores.timeouter),
            self.config.timeouter.clone(),
            self.metrics.clone(),
        );
        let timeouter = tokio::spawn(timeouter.run(shutdown.clone()));

        let api = match self.start_api_server(dispatcher.stats(), shutdown.clone()).await {
            Ok((api_addr, api)) => {
                info!(%api_addr, "API server started");
                Some(api)
            },
            Err(e) => {
                error!(error = %e, "API server failed to start");
                shutdown.cancel();
                None
            },
        };

        tokio::select! {
            _ = stop.cancelled() => info!("Shutdown requested"),
            _ = shutdown.cancelled() => error!("Component failure, shutting down"),
        }
        shutdown.cancel();

        // Drain in pipeline order
        let mut results = vec![
            flatten(coordinator.await, "coordinator"),
            dispatcher.join().await.map_err(DaemonError::from),
            dumper.join().await,
            flatten(timeouter.await, "timeouter"),
        ];
        if let Err(e) = sink.await {
            results.push(Err(DaemonError::Task(format!("notification sink: {}", e))));
        }
        match api {
            Some(api) => results.push(flatten(api.await, "api")),
            None => results.push(Err(DaemonError::Config("API server failed to start".to_string()))),
        }

        info!("MSQ daemon stopped");
        results.into_iter().collect::<DaemonResult<Vec<()>>>().map(|_| ())
    }

    /// Start the API server; it stops when `shutdown` fires.
    async fn start_api_server(
        &self,
        pool_stats: PoolStats,
        shutdown: CancellationToken,
    ) -> DaemonResult<(SocketAddr, JoinHandle<DaemonResult<()>>)> {
        let state = Arc::new(ApiState {
            store: Arc::clone(&self.stores.api),
            dictionaries: Arc::clone(&self.dictionaries),
            statuses: self.statuses,
            execution_window: self.config.api.execution_window,
            metrics: self.metrics.clone(),
            pool_stats: Some(pool_stats),
        });

        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            DaemonError::Config(format!("Failed to bind to {}: {}", addr, e))
        })?;

        let local_addr = listener.local_addr().map_err(|e| {
            DaemonError::Config(format!("Failed to get local address: {}", e))
        })?;

        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .map_err(|e| DaemonError::Task(format!("API server error: {}", e)))
        });

        Ok((local_addr, server))
    }
}

fn flatten(
    joined: Result<DaemonResult<()>, tokio::task::JoinError>,
    task: &str,
) -> DaemonResult<()> {
    joined.map_err(|e| DaemonError::Task(format!("{}: {}", task, e))).and_then(|r| r)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_stub_daemon() {
        assert!(Daemon::new_stub(Config::test()).is_ok());
    }

    #[test]
    fn test_unknown_exchange_rejected() {
        let mut config = Config::test();
        config.connector.exchange_id = 42;

        let result = Daemon::new_stub(config);
        assert!(matches!(result, Err(DaemonError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_until_stop_drains_cleanly() {
        let daemon = Daemon::new_stub(Config::test()).unwrap();
        let stop = CancellationToken::new();
        let task = tokio::spawn(daemon.run_until(stop.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    }
}
