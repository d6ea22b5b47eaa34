//! Dumper: persists dispatcher outcomes and forwards them downstream.
//!
//! A bounded pool fed round-robin through the same [`WorkerRing`] as the
//! dispatcher. Each response becomes one `EXECUTING → terminal` transition
//! with its Order and Balances attached.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use msq_domain::CommandStatus;
use msq_exec::{ExecResponse, ExecType, Handoff, Status, WorkerQueue, WorkerRing};
use msq_store::{CommandStore, Finish, StoreError};

use crate::config::ConnectorConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::metrics::EngineMetrics;

/// Dumper pool settings.
#[derive(Debug, Clone)]
pub struct DumperConfig {
    pub pool_size: usize,
    /// Delay between attempts after a transient store error
    pub retry_delay: Duration,
    /// Idle workers ping the store this often
    pub ping_interval: Duration,
}

impl From<&ConnectorConfig> for DumperConfig {
    fn from(config: &ConnectorConfig) -> Self {
        Self {
            pool_size: config.dumper_pool_size,
            retry_delay: config.dumper_retry_delay,
            ping_interval: config.dumper_ping_interval,
        }
    }
}

/// Transition to persist for a response.
///
/// Every outcome leaves EXECUTING. Only successful `Execute`/`Check` responses
/// carry an Order.
pub fn finish_for(response: &ExecResponse) -> Finish {
    let to = match response.status {
        Status::Ok => CommandStatus::Completed,
        Status::Error => CommandStatus::Error,
        Status::TimedOut => CommandStatus::TimedOut,
        Status::Rejected => CommandStatus::Rejected,
    };
    let order = match (response.status, response.request.what) {
        (Status::Ok, ExecType::Execute | ExecType::Check) => response.order.clone(),
        _ => None,
    };

    Finish {
        execution_id: response.id(),
        connector_id: response.request.cmd.connector_id,
        from: CommandStatus::Executing,
        to,
        description: response.description.clone(),
        order,
        balances: response.balances.clone().unwrap_or_default(),
    }
}

/// Handle to a running dumper pool.
pub struct DumperHandle {
    tasks: JoinSet<DaemonResult<()>>,
}

impl DumperHandle {
    /// Wait for the intake and every worker to exit; returns the first error.
    pub async fn join(mut self) -> DaemonResult<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.map_err(|e| DaemonError::Task(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Persisting worker pool.
pub struct Dumper;

impl Dumper {
    /// Spawn the intake task and `pool_size` workers.
    ///
    /// The intake runs until every sender of `intake` is dropped; workers
    /// then finish what they hold and exit, closing `downstream`.
    pub fn spawn<S>(
        store: Arc<S>,
        config: DumperConfig,
        intake: mpsc::Receiver<ExecResponse>,
        downstream: mpsc::Sender<ExecResponse>,
        metrics: EngineMetrics,
        shutdown: CancellationToken,
    ) -> DaemonResult<DumperHandle>
    where
        S: CommandStore + ?Sized + 'static,
    {
        msq_exec::dispatcher::validate_pool_size("dumper", config.pool_size)?;

        let (ring, queues) = WorkerRing::with_capacity(config.pool_size, config.pool_size * 2);
        let mut tasks = JoinSet::new();

        for (worker, queue) in queues.into_iter().enumerate() {
            let worker = DumperWorker {
                id: worker,
                store: Arc::clone(&store),
                downstream: downstream.clone(),
                metrics: metrics.clone(),
                retry_delay: config.retry_delay,
                ping_interval: config.ping_interval,
            };
            tasks.spawn(worker.run(queue, shutdown.clone()));
        }
        drop(downstream);

        tasks.spawn(run_intake(intake, ring, shutdown));

        info!(pool_size = config.pool_size, "Dumper started");
        Ok(DumperHandle { tasks })
    }
}

async fn run_intake(
    mut intake: mpsc::Receiver<ExecResponse>,
    ring: WorkerRing<ExecResponse>,
    shutdown: CancellationToken,
) -> DaemonResult<()> {
    while let Some(response) = intake.recv().await {
        let id = response.id();
        match ring.handoff(response).await {
            Ok(Handoff::Immediate { worker, .. }) => {
                debug!(execution_id = id, worker, "Response handed to dumper");
            },
            Ok(Handoff::Blocking { worker }) => {
                debug!(execution_id = id, worker, "All dumpers busy, waited for handoff");
            },
            Err(_) => {
                shutdown.cancel();
                return Err(DaemonError::ProtocolViolation(format!(
                    "no dumper worker accepted response {}",
                    id
                )));
            },
        }
    }

    if shutdown.is_cancelled() {
        debug!("Dumper intake closed");
        Ok(())
    } else {
        shutdown.cancel();
        Err(DaemonError::ProtocolViolation("dumper intake closed outside shutdown".to_string()))
    }
}

struct DumperWorker<S: ?Sized> {
    id: usize,
    store: Arc<S>,
    downstream: mpsc::Sender<ExecResponse>,
    metrics: EngineMetrics,
    retry_delay: Duration,
    ping_interval: Duration,
}

impl<S: CommandStore + ?Sized> DumperWorker<S> {
    async fn run(
        self,
        mut queue: WorkerQueue<ExecResponse>,
        shutdown: CancellationToken,
    ) -> DaemonResult<()> {
        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await; // First tick is immediate

        loop {
            tokio::select! {
                next = queue.recv() => {
                    let Some(response) = next else { break };
                    self.handle(response, &shutdown).await?;
                    ping.reset();
                }
                _ = ping.tick() => {
                    if let Err(e) = self.store.ping().await {
                        warn!(worker = self.id, error = %e, "Dumper store ping failed");
                        self.metrics.store_error("dumper");
                    }
                }
            }
        }

        debug!(worker = self.id, "Dumper worker drained");
        Ok(())
    }

    async fn handle(&self, response: ExecResponse, shutdown: &CancellationToken) -> DaemonResult<()> {
        let id = response.id();
        let finish = finish_for(&response);
        let to = finish.to;

        if !self.persist(finish, shutdown).await {
            warn!(
                execution_id = id,
                "Shutdown while persisting; command stays EXECUTING until recovered"
            );
            return Ok(());
        }

        debug!(execution_id = id, worker = self.id, to = %to, "Outcome persisted");

        if self.downstream.send(response).await.is_err() {
            shutdown.cancel();
            return Err(DaemonError::ProtocolViolation(format!(
                "notification sink closed while forwarding response {}",
                id
            )));
        }
        Ok(())
    }

    /// Persist until success. Returns `false` if shutdown interrupted a retry.
    async fn persist(&self, finish: Finish, shutdown: &CancellationToken) -> bool {
        let id = finish.execution_id;
        let mut attempt = 1u32;

        loop {
            match self.store.finish(finish.clone()).await {
                Ok(()) => return true,
                Err(e) if e.is_transient() => {
                    error!(execution_id = id, attempt, error = %e, "Persisting outcome failed (will retry)");
                    self.metrics.store_error("dumper");
                },
                Err(e @ (StoreError::InvalidState { .. } | StoreError::NotFound { .. })) => {
                    warn!(execution_id = id, error = %e, "Outcome not persisted, forwarding anyway");
                    return true;
                },
                Err(e) => {
                    error!(execution_id = id, error = %e, "Outcome rejected by store, forwarding anyway");
                    self.metrics.store_error("dumper");
                    return true;
                },
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Log every persisted outcome until the dumper closes the channel.
pub async fn run_notification_sink(mut outcomes: mpsc::Receiver<ExecResponse>) {
    while let Some(response) = outcomes.recv().await {
        info!(
            execution_id = response.id(),
            what = ?response.request.what,
            status = response.status.as_str(),
            description = %response.description,
            latency_ms = response.outside_execution.as_millis() as u64,
            "Command outcome"
        );
    }
    debug!("Notification sink closed");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use msq_domain::{Balance, Dictionaries, Order};
    use msq_exec::ExecRequest;
    use msq_store::MemoryStore;
    use msq_testkit::CommandFixture;
    use rust_decimal_macros::dec;

    async fn executing(store: &MemoryStore, fixture: CommandFixture) -> msq_domain::Command {
        let id = store.insert_command(fixture.new_command()).await.unwrap();
        let exchange_id = store.command(id).unwrap().exchange_id;
        let mut claimed = store
            .claim_for_execution(exchange_id, 1, chrono::Utc::now(), 10)
            .await
            .unwrap();
        claimed.retain(|c| c.id == id);
        claimed.remove(0)
    }

    fn request(what: ExecType, cmd: msq_domain::Command) -> ExecRequest {
        ExecRequest::new(what, cmd, &Dictionaries::builtin())
    }

    fn order(id: i64) -> Order {
        Order {
            external_order_id: 42,
            execution_id: id,
            price: dec!(100),
            commission: dec!(0.1),
            commission_asset: "BNB".to_string(),
        }
    }

    fn config() -> DumperConfig {
        DumperConfig {
            pool_size: 2,
            retry_delay: Duration::from_millis(10),
            ping_interval: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_finish_mapping_ok_execute_keeps_order() {
        let store = MemoryStore::new();
        let cmd = executing(&store, CommandFixture::market_buy("ABC", dec!(1))).await;
        let id = cmd.id;
        let response = ExecResponse::ok(request(ExecType::Execute, cmd)).with_order(order(id));

        let finish = finish_for(&response);
        assert_eq!(finish.from, CommandStatus::Executing);
        assert_eq!(finish.to, CommandStatus::Completed);
        assert_eq!(finish.connector_id, Some(1));
        assert_eq!(finish.order, Some(order(id)));
    }

    #[tokio::test]
    async fn test_finish_mapping_info_and_failures() {
        let store = MemoryStore::new();
        let cmd = executing(&store, CommandFixture::info()).await;
        let balances = vec![Balance {
            asset: "USDT".to_string(),
            free: dec!(10),
            locked: dec!(0),
        }];
        let response = ExecResponse::ok(request(ExecType::Info, cmd.clone()))
            .with_order(order(cmd.id))
            .with_balances(balances.clone());

        let finish = finish_for(&response);
        assert_eq!(finish.to, CommandStatus::Completed);
        assert_eq!(finish.order, None);
        assert_eq!(finish.balances, balances);

        for (status, expected) in [
            (Status::Error, CommandStatus::Error),
            (Status::TimedOut, CommandStatus::TimedOut),
            (Status::Rejected, CommandStatus::Rejected),
        ] {
            let response = ExecResponse::new(request(ExecType::Execute, cmd.clone()), status, "x")
                .with_order(order(cmd.id));
            let finish = finish_for(&response);
            assert_eq!(finish.to, expected);
            assert_eq!(finish.order, None);
            assert_eq!(finish.description, "x");
        }
    }

    #[tokio::test]
    async fn test_persists_and_forwards() {
        let store = Arc::new(MemoryStore::new());
        let cmd = executing(&store, CommandFixture::market_buy("ABC", dec!(1))).await;
        let id = cmd.id;
        let shutdown = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let handle = Dumper::spawn(
            Arc::clone(&store),
            config(),
            in_rx,
            out_tx,
            EngineMetrics::new().unwrap(),
            shutdown.clone(),
        )
        .unwrap();

        in_tx
            .send(ExecResponse::ok(request(ExecType::Execute, cmd)).with_order(order(id)))
            .await
            .unwrap();

        let forwarded = out_rx.recv().await.unwrap();
        assert_eq!(forwarded.id(), id);
        assert_eq!(store.status_of(id), Some(CommandStatus::Completed));
        let record = store.load_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.order, Some(order(id)));

        shutdown.cancel();
        drop(in_tx);
        handle.join().await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_persisted() {
        let store = Arc::new(MemoryStore::new());
        let cmd = executing(&store, CommandFixture::market_buy("ABC", dec!(1))).await;
        let id = cmd.id;
        let shutdown = CancellationToken::new();
        let metrics = EngineMetrics::new().unwrap();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let handle = Dumper::spawn(
            Arc::clone(&store),
            config(),
            in_rx,
            out_tx,
            metrics.clone(),
            shutdown.clone(),
        )
        .unwrap();

        store.fail_next(3);
        in_tx.send(ExecResponse::error(request(ExecType::Execute, cmd), "boom")).await.unwrap();

        assert_eq!(out_rx.recv().await.unwrap().id(), id);
        assert_eq!(store.status_of(id), Some(CommandStatus::Error));
        assert_eq!(metrics.store_errors("dumper"), 3);

        shutdown.cancel();
        drop(in_tx);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_state_forwarded_without_retry() {
        let store = Arc::new(MemoryStore::new());
        let cmd = executing(&store, CommandFixture::market_buy("ABC", dec!(1))).await;
        let id = cmd.id;
        store
            .finish(Finish::transition(id, CommandStatus::Executing, CommandStatus::Error, "first"))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let handle = Dumper::spawn(
            Arc::clone(&store),
            config(),
            in_rx,
            out_tx,
            EngineMetrics::new().unwrap(),
            shutdown.clone(),
        )
        .unwrap();

        in_tx.send(ExecResponse::ok(request(ExecType::Execute, cmd))).await.unwrap();

        assert_eq!(out_rx.recv().await.unwrap().id(), id);
        assert_eq!(store.status_of(id), Some(CommandStatus::Error));

        shutdown.cancel();
        drop(in_tx);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_retry_leaves_command_executing() {
        let store = Arc::new(MemoryStore::new());
        let cmd = executing(&store, CommandFixture::market_buy("ABC", dec!(1))).await;
        let id = cmd.id;
        let shutdown = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let mut config = config();
        config.retry_delay = Duration::from_secs(60);

        let handle = Dumper::spawn(
            Arc::clone(&store),
            config,
            in_rx,
            out_tx,
            EngineMetrics::new().unwrap(),
            shutdown.clone(),
        )
        .unwrap();

        store.fail_next(1);
        in_tx.send(ExecResponse::ok(request(ExecType::Execute, cmd))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.cancel();
        drop(in_tx);
        handle.join().await.unwrap();

        assert!(out_rx.recv().await.is_none());
        assert_eq!(store.status_of(id), Some(CommandStatus::Executing));
    }

    #[tokio::test]
    async fn test_intake_closed_outside_shutdown_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let (in_tx, in_rx) = mpsc::channel::<ExecResponse>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);

        let handle = Dumper::spawn(
            store,
            config(),
            in_rx,
            out_tx,
            EngineMetrics::new().unwrap(),
            shutdown.clone(),
        )
        .unwrap();
        drop(in_tx);

        assert!(matches!(handle.join().await, Err(DaemonError::ProtocolViolation(_))));
        assert!(shutdown.is_cancelled());
    }
}
