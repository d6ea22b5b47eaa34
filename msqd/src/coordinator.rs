//! Coordinator: claims work for one connector and drives the dispatcher.
//!
//! # Loops
//!
//! - **Completion**: drains dispatcher responses, releases admission budget,
//!   wakes the recovery step waiting on that command and forwards the response
//!   to the Dumper.
//! - **Recovery** (startup only): EXECUTING commands of this connector left
//!   untouched for `recovery_staleness` are re-checked one at a time with a
//!   `Check` request. Finishes before any new work is claimed.
//! - **Dispatch**: while there is admission budget, claims one CREATED command
//!   and sends it as `Execute` (or `Info` for INFO orders).
//!
//! At most `capacity` requests are outstanding at any time.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use msq_domain::{names, Command, CommandId, ConnectorId, DictId, Dictionaries, ExchangeId};
use msq_exec::{ExecRequest, ExecResponse, ExecType};
use msq_store::CommandStore;

use crate::admission::AdmissionCounter;
use crate::config::ConnectorConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::EngineMetrics;

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub exchange_id: ExchangeId,
    pub connector_id: ConnectorId,
    pub recovery_staleness: Duration,
    pub claim_grace: Duration,
    pub poll_interval: Duration,
    pub store_error_backoff: Duration,
}

impl From<&ConnectorConfig> for CoordinatorConfig {
    fn from(config: &ConnectorConfig) -> Self {
        Self {
            exchange_id: config.exchange_id,
            connector_id: config.connector_id,
            recovery_staleness: config.recovery_staleness,
            claim_grace: config.claim_grace,
            poll_interval: config.poll_interval,
            store_error_backoff: config.store_error_backoff,
        }
    }
}

/// Channels between the Coordinator, the dispatcher and the Dumper.
pub struct CoordinatorChannels {
    /// Dispatcher intake
    pub requests: mpsc::Sender<ExecRequest>,
    /// Dispatcher output
    pub responses: mpsc::Receiver<ExecResponse>,
    /// Dumper intake
    pub downstream: mpsc::Sender<ExecResponse>,
}

/// Claims and dispatches the work of one `(exchange, connector)` pair.
pub struct Coordinator<S: CommandStore + ?Sized> {
    store: Arc<S>,
    dictionaries: Arc<Dictionaries>,
    admission: Arc<AdmissionCounter>,
    metrics: EngineMetrics,
    config: CoordinatorConfig,
    info_order_type: DictId,
}

impl<S: CommandStore + ?Sized + 'static> Coordinator<S> {
    pub fn new(
        store: Arc<S>,
        dictionaries: Arc<Dictionaries>,
        admission: Arc<AdmissionCounter>,
        metrics: EngineMetrics,
        config: CoordinatorConfig,
    ) -> Self {
        let info_order_type = dictionaries.order_types().id_by_name(names::order_type::INFO);
        Self {
            store,
            dictionaries,
            admission,
            metrics,
            config,
            info_order_type,
        }
    }

    /// Run recovery, then dispatch until `shutdown`.
    ///
    /// On shutdown the request sender is dropped and this waits for the
    /// completion loop, which ends once the dispatcher has drained.
    ///
    /// # Errors
    /// `DaemonError::ProtocolViolation` if a channel closes outside shutdown;
    /// `shutdown` is cancelled in that case.
    pub async fn run(
        self,
        channels: CoordinatorChannels,
        shutdown: CancellationToken,
    ) -> DaemonResult<()> {
        let CoordinatorChannels {
            requests,
            responses,
            downstream,
        } = channels;

        info!(
            exchange_id = self.config.exchange_id,
            connector_id = self.config.connector_id,
            capacity = self.admission.capacity(),
            "Coordinator started"
        );

        let waiter = Arc::new(RecoveryWaiter::default());
        let completion = tokio::spawn(run_completion(
            responses,
            downstream,
            Arc::clone(&self.admission),
            Arc::clone(&waiter),
            self.metrics.clone(),
            shutdown.clone(),
        ));

        let mut result = self.recover(&requests, &waiter, &shutdown).await;
        if result.is_ok() {
            result = self.dispatch(&requests, &shutdown).await;
        }
        if result.is_err() {
            shutdown.cancel();
        }

        drop(requests);
        let completed = completion
            .await
            .map_err(|e| DaemonError::Task(format!("coordinator completion loop: {}", e)))
            .and_then(|r| r);

        info!("Coordinator stopped");
        result.and(completed)
    }

    async fn recover(
        &self,
        requests: &mpsc::Sender<ExecRequest>,
        waiter: &RecoveryWaiter,
        shutdown: &CancellationToken,
    ) -> DaemonResult<()> {
        let mut recovered = 0usize;

        while !shutdown.is_cancelled() {
            let older_than = before(Utc::now(), self.config.recovery_staleness);
            let claimed = self
                .store
                .claim_for_recovery(self.config.exchange_id, self.config.connector_id, older_than)
                .await;

            let cmd = match claimed {
                Ok(Some(cmd)) => cmd,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Recovery claim failed (will retry)");
                    self.metrics.store_error("coordinator");
                    self.backoff(shutdown).await;
                    continue;
                },
            };

            if !self.admission.wait_for_budget(shutdown).await {
                break;
            }

            let id = cmd.id;
            let (done_tx, done_rx) = oneshot::channel();
            waiter.register(id, done_tx);

            info!(execution_id = id, "Recovering stale command with a check");
            self.send(requests, ExecType::Check, cmd, shutdown).await?;

            tokio::select! {
                done = done_rx => {
                    if done.is_err() && !shutdown.is_cancelled() {
                        return Err(DaemonError::ProtocolViolation(format!(
                            "completion loop ended while recovering command {}",
                            id
                        )));
                    }
                }
                _ = shutdown.cancelled() => break,
            }
            recovered += 1;
        }

        info!(recovered, "Recovery finished");
        Ok(())
    }

    async fn dispatch(
        &self,
        requests: &mpsc::Sender<ExecRequest>,
        shutdown: &CancellationToken,
    ) -> DaemonResult<()> {
        while !shutdown.is_cancelled() {
            if !self.admission.wait_for_budget(shutdown).await {
                break;
            }

            let not_after = before(Utc::now(), self.config.claim_grace);
            let claimed = self
                .store
                .claim_for_execution(self.config.exchange_id, self.config.connector_id, not_after, 1)
                .await;

            match claimed {
                Ok(commands) if commands.is_empty() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                },
                Ok(commands) => {
                    for cmd in commands {
                        let what = if cmd.order_type_id == self.info_order_type {
                            ExecType::Info
                        } else {
                            ExecType::Execute
                        };
                        self.send(requests, what, cmd, shutdown).await?;
                    }
                },
                Err(e) => {
                    error!(error = %e, "Claim for execution failed (will retry)");
                    self.metrics.store_error("coordinator");
                    self.backoff(shutdown).await;
                },
            }
        }

        debug!("Dispatch loop stopped");
        Ok(())
    }

    /// Count the request in flight and hand it to the dispatcher.
    async fn send(
        &self,
        requests: &mpsc::Sender<ExecRequest>,
        what: ExecType,
        cmd: Command,
        shutdown: &CancellationToken,
    ) -> DaemonResult<()> {
        let id = cmd.id;
        let request = ExecRequest::new(what, cmd, &self.dictionaries);

        let in_flight = self.admission.increment();
        self.metrics.in_flight.set(in_flight as i64);
        debug!(execution_id = id, what = ?what, in_flight, "Dispatching request");

        if requests.send(request).await.is_err() {
            self.admission.release();
            if shutdown.is_cancelled() {
                warn!(execution_id = id, "Dispatcher gone during shutdown; command stays EXECUTING");
                return Ok(());
            }
            return Err(DaemonError::ProtocolViolation(format!(
                "dispatcher intake closed while sending command {}",
                id
            )));
        }
        Ok(())
    }

    async fn backoff(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.store_error_backoff) => {}
        }
    }
}

async fn run_completion(
    mut responses: mpsc::Receiver<ExecResponse>,
    downstream: mpsc::Sender<ExecResponse>,
    admission: Arc<AdmissionCounter>,
    waiter: Arc<RecoveryWaiter>,
    metrics: EngineMetrics,
    shutdown: CancellationToken,
) -> DaemonResult<()> {
    while let Some(response) = responses.recv().await {
        let id = response.id();
        let in_flight = admission.release();
        metrics.in_flight.set(in_flight as i64);
        metrics.observe_response(response.status);
        waiter.release(id);

        debug!(
            execution_id = id,
            status = response.status.as_str(),
            in_flight,
            "Response observed"
        );

        if downstream.send(response).await.is_err() {
            shutdown.cancel();
            return Err(DaemonError::ProtocolViolation(format!(
                "dumper intake closed while forwarding response {}",
                id
            )));
        }
    }

    if shutdown.is_cancelled() {
        debug!("Completion loop drained");
        Ok(())
    } else {
        shutdown.cancel();
        Err(DaemonError::ProtocolViolation(
            "dispatcher output closed outside shutdown".to_string(),
        ))
    }
}

/// The single recovery step waiting for its response.
#[derive(Default)]
struct RecoveryWaiter {
    slot: Mutex<Option<(CommandId, oneshot::Sender<()>)>>,
}

impl RecoveryWaiter {
    fn register(&self, id: CommandId, done: oneshot::Sender<()>) {
        *self.lock() = Some((id, done));
    }

    fn release(&self, id: CommandId) {
        let mut slot = self.lock();
        if matches!(slot.as_ref(), Some((waiting, _)) if *waiting == id) {
            if let Some((_, done)) = slot.take() {
                let _ = done.send(());
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<(CommandId, oneshot::Sender<()>)>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn before(now: DateTime<Utc>, offset: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(offset).map(|d| now - d).unwrap_or(now)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use msq_domain::CommandStatus;
    use msq_exec::{Dispatcher, DispatcherConfig, StubExchange};
    use msq_store::MemoryStore;
    use msq_testkit::CommandFixture;
    use rust_decimal_macros::dec;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            exchange_id: 1,
            connector_id: 1,
            recovery_staleness: Duration::from_secs(30),
            claim_grace: Duration::from_secs(1),
            poll_interval: Duration::from_millis(5),
            store_error_backoff: Duration::from_millis(10),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        exchange: Arc<StubExchange>,
        downstream: mpsc::Receiver<ExecResponse>,
        shutdown: CancellationToken,
        coordinator: tokio::task::JoinHandle<DaemonResult<()>>,
        dispatcher: msq_exec::DispatcherHandle,
    }

    fn start(store: Arc<MemoryStore>, exchange: StubExchange, pool_size: usize) -> Harness {
        let exchange = Arc::new(exchange);
        let shutdown = CancellationToken::new();
        let (req_tx, req_rx) = mpsc::channel(pool_size);
        let (resp_tx, resp_rx) = mpsc::channel(pool_size);
        let (down_tx, down_rx) = mpsc::channel(64);

        let dispatcher = Dispatcher::spawn(
            Arc::clone(&exchange),
            DispatcherConfig::new(pool_size),
            req_rx,
            resp_tx,
            shutdown.clone(),
        )
        .unwrap();

        let coordinator = Coordinator::new(
            Arc::clone(&store),
            Arc::new(Dictionaries::builtin()),
            Arc::new(AdmissionCounter::new(pool_size)),
            EngineMetrics::new().unwrap(),
            config(),
        );
        let channels = CoordinatorChannels {
            requests: req_tx,
            responses: resp_rx,
            downstream: down_tx,
        };
        let coordinator = tokio::spawn(coordinator.run(channels, shutdown.clone()));

        Harness {
            store,
            exchange,
            downstream: down_rx,
            shutdown,
            coordinator,
            dispatcher,
        }
    }

    impl Harness {
        async fn next(&mut self) -> ExecResponse {
            tokio::time::timeout(Duration::from_secs(5), self.downstream.recv())
                .await
                .unwrap()
                .unwrap()
        }

        async fn stop(self) {
            self.shutdown.cancel();
            // Keep the downstream open while the pipeline drains
            let mut downstream = self.downstream;
            let drain = tokio::spawn(async move { while downstream.recv().await.is_some() {} });
            self.coordinator.await.unwrap().unwrap();
            self.dispatcher.join().await.unwrap();
            drain.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dispatches_created_command() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert_command(CommandFixture::market_buy("ABC", dec!(10)).new_command())
            .await
            .unwrap();

        let mut harness = start(Arc::clone(&store), StubExchange::new(dec!(100)), 2);

        let response = harness.next().await;
        assert_eq!(response.id(), id);
        assert!(response.is(ExecType::Execute));
        assert_eq!(store.status_of(id), Some(CommandStatus::Executing));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_info_orders_dispatched_as_info() {
        let store = Arc::new(MemoryStore::new());
        let id = store.insert_command(CommandFixture::info().new_command()).await.unwrap();

        let mut harness = start(Arc::clone(&store), StubExchange::new(dec!(100)), 1);

        let response = harness.next().await;
        assert_eq!(response.id(), id);
        assert!(response.is(ExecType::Info));
        assert_eq!(harness.exchange.call_count(ExecType::Execute), 0);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_recovery_checks_before_dispatch() {
        let store = Arc::new(MemoryStore::new());
        let stale = CommandFixture::market_buy("OLD", dec!(1)).command(
            100,
            CommandStatus::Executing,
            Some(1),
            Utc::now() - chrono::Duration::minutes(5),
        );
        let stale_id = store.seed(stale).unwrap();
        let fresh_id = store
            .insert_command(CommandFixture::market_buy("NEW", dec!(1)).new_command())
            .await
            .unwrap();

        let mut harness = start(Arc::clone(&store), StubExchange::new(dec!(100)), 4);

        let first = harness.next().await;
        let second = harness.next().await;
        assert_eq!(first.id(), stale_id);
        assert!(first.is(ExecType::Check));
        assert_eq!(second.id(), fresh_id);
        assert!(second.is(ExecType::Execute));

        let calls = harness.exchange.calls();
        assert_eq!(calls[0], (ExecType::Check, stale_id));
        assert!(!calls.contains(&(ExecType::Execute, stale_id)));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..12 {
            store
                .insert_command(
                    CommandFixture::market_buy("ABC", dec!(1))
                        .fingerprint(&format!("cap-{}", i))
                        .new_command(),
                )
                .await
                .unwrap();
        }

        let exchange = StubExchange::new(dec!(100)).with_latency(Duration::from_millis(20));
        let mut harness = start(Arc::clone(&store), exchange, 3);

        for _ in 0..12 {
            harness.next().await;
        }
        assert!(harness.exchange.max_concurrent() <= 3);
        assert_eq!(harness.exchange.call_count(ExecType::Execute), 12);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_store_errors_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert_command(CommandFixture::market_buy("ABC", dec!(1)).new_command())
            .await
            .unwrap();
        store.fail_next(3);

        let mut harness = start(Arc::clone(&store), StubExchange::new(dec!(100)), 1);

        assert_eq!(harness.next().await.id(), id);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_closed_dispatcher_output_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let (req_tx, _req_rx) = mpsc::channel(1);
        let (resp_tx, resp_rx) = mpsc::channel(1);
        let (down_tx, _down_rx) = mpsc::channel(1);
        drop(resp_tx);

        let coordinator = Coordinator::new(
            store,
            Arc::new(Dictionaries::builtin()),
            Arc::new(AdmissionCounter::new(1)),
            EngineMetrics::new().unwrap(),
            config(),
        );
        let channels = CoordinatorChannels {
            requests: req_tx,
            responses: resp_rx,
            downstream: down_tx,
        };

        let result = coordinator.run(channels, shutdown.clone()).await;
        assert!(matches!(result, Err(DaemonError::ProtocolViolation(_))));
        assert!(shutdown.is_cancelled());
    }

    #[test]
    fn test_recovery_waiter_ignores_other_ids() {
        let waiter = RecoveryWaiter::default();
        let (tx, mut rx) = oneshot::channel();
        waiter.register(7, tx);

        waiter.release(8);
        assert!(rx.try_recv().is_err());

        waiter.release(7);
        assert!(rx.try_recv().is_ok());
    }
}
