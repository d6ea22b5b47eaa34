//! Dispatcher (Connector): bounded worker pool in front of one exchange.
//!
//! ```text
//!                       ┌─► worker 0 ─┐
//! requests ─► intake ───┼─► worker 1 ─┼──► responses
//!          (round-robin)└─► worker N ─┘   (shared sender)
//! ```
//!
//! The intake task reads one request at a time and hands it to a worker via
//! [`WorkerRing`]. Workers call the exchange and send the response on the
//! shared output; a tokio `mpsc::Sender` delivers each message whole, so
//! responses never interleave.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ExecError, ExecResult};
use crate::ports::ExchangePort;
use crate::proto::{ExecRequest, ExecResponse, ExecType};
use crate::ring::{Handoff, WorkerQueue, WorkerRing};

/// Largest accepted worker pool.
pub const MAX_POOL_SIZE: usize = 10_000;

/// Description used when the deadline passes before the trade is sent.
pub const DEADLINE_PASSED: &str = "timed out right before actual sending";

// =============================================================================
// Configuration
// =============================================================================

/// Dispatcher pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Number of exchange workers
    pub pool_size: usize,
    /// Non-blocking handoff attempts before waiting on a busy worker
    /// (defaults to two full ring cycles)
    pub handoff_attempts: Option<usize>,
}

impl DispatcherConfig {
    /// Pool of `pool_size` workers with default handoff attempts
    pub fn new(pool_size: usize) -> Self {
        Self { pool_size, handoff_attempts: None }
    }

    /// Check the pool size is within 1..=10000.
    pub fn validate(&self) -> ExecResult<()> {
        validate_pool_size("dispatcher", self.pool_size)
    }

    /// Effective handoff attempts
    pub fn attempts(&self) -> usize {
        self.handoff_attempts.unwrap_or(self.pool_size * 2).max(1)
    }
}

/// Validate a worker pool size.
///
/// # Errors
/// Returns `ExecError::Config` unless `1 <= size <= MAX_POOL_SIZE`
pub fn validate_pool_size(pool: &str, size: usize) -> ExecResult<()> {
    if size == 0 || size > MAX_POOL_SIZE {
        return Err(ExecError::Config(format!(
            "{} pool size must be between 1 and {}, got {}",
            pool, MAX_POOL_SIZE, size
        )));
    }
    Ok(())
}

// =============================================================================
// Pool statistics
// =============================================================================

/// Live occupancy of a worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    busy: Arc<AtomicUsize>,
    size: usize,
}

impl PoolStats {
    /// Stats for a pool of `size` workers
    pub fn new(size: usize) -> Self {
        Self { busy: Arc::new(AtomicUsize::new(0)), size }
    }

    /// Workers currently inside an exchange call
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    /// Pool size
    pub fn size(&self) -> usize {
        self.size
    }

    fn enter(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    fn leave(&self) {
        self.busy.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Handle to a running dispatcher.
pub struct DispatcherHandle {
    tasks: JoinSet<ExecResult<()>>,
    stats: PoolStats,
}

impl DispatcherHandle {
    /// Occupancy of the worker pool
    pub fn stats(&self) -> PoolStats {
        self.stats.clone()
    }

    /// Wait for the intake and every worker to exit.
    ///
    /// # Errors
    /// Returns the first error any task ended with.
    pub async fn join(mut self) -> ExecResult<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.map_err(|e| ExecError::Worker(e.to_string())).and_then(|r| r);
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

/// Bounded worker pool executing requests against one exchange.
pub struct Dispatcher;

impl Dispatcher {
    /// Spawn the intake task and `pool_size` workers.
    ///
    /// Shutdown: once `shutdown` is cancelled the intake keeps forwarding
    /// requests until every request sender is dropped, then closes the worker
    /// queues; workers finish what they hold and exit, closing `out`.
    ///
    /// A closed intake before shutdown, or a malformed request, is a protocol
    /// violation: `shutdown` is cancelled and [`DispatcherHandle::join`]
    /// reports the error.
    pub fn spawn<E>(
        exchange: Arc<E>,
        config: DispatcherConfig,
        intake: mpsc::Receiver<ExecRequest>,
        out: mpsc::Sender<ExecResponse>,
        shutdown: CancellationToken,
    ) -> ExecResult<DispatcherHandle>
    where
        E: ExchangePort + ?Sized + 'static,
    {
        config.validate()?;

        let stats = PoolStats::new(config.pool_size);
        let (ring, queues) = WorkerRing::with_capacity(config.pool_size, config.attempts());
        let mut tasks = JoinSet::new();

        for (worker, queue) in queues.into_iter().enumerate() {
            tasks.spawn(run_worker(
                worker,
                Arc::clone(&exchange),
                queue,
                out.clone(),
                stats.clone(),
            ));
        }
        drop(out);

        tasks.spawn(run_intake(intake, ring, shutdown));

        info!(pool_size = config.pool_size, "Dispatcher started");
        Ok(DispatcherHandle { tasks, stats })
    }
}

async fn run_intake(
    mut intake: mpsc::Receiver<ExecRequest>,
    ring: WorkerRing<ExecRequest>,
    shutdown: CancellationToken,
) -> ExecResult<()> {
    let mut draining = false;

    loop {
        let next = if draining {
            intake.recv().await
        } else {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Dispatcher draining");
                    draining = true;
                    continue;
                }
                next = intake.recv() => next,
            }
        };

        let Some(request) = next else {
            if shutdown.is_cancelled() {
                debug!("Dispatcher intake closed");
                return Ok(());
            }
            return Err(violation(&shutdown, ExecError::protocol("dispatcher intake closed")));
        };

        if let Err(e) = request.validate() {
            return Err(violation(&shutdown, e));
        }

        let id = request.id();
        match ring.handoff(request).await {
            Ok(Handoff::Immediate { worker, attempts }) => {
                debug!(execution_id = id, worker, attempts, "Request handed off");
            },
            Ok(Handoff::Blocking { worker }) => {
                warn!(execution_id = id, worker, "All workers busy, waited for handoff");
            },
            Err(_) => {
                return Err(violation(
                    &shutdown,
                    ExecError::protocol(format!("no dispatcher worker accepted request {}", id)),
                ));
            },
        }
    }
}

fn violation(shutdown: &CancellationToken, err: ExecError) -> ExecError {
    error!(error = %err, "Dispatcher stopping on protocol violation");
    shutdown.cancel();
    err
}

async fn run_worker<E>(
    worker: usize,
    exchange: Arc<E>,
    mut queue: WorkerQueue<ExecRequest>,
    out: mpsc::Sender<ExecResponse>,
    stats: PoolStats,
) -> ExecResult<()>
where
    E: ExchangePort + ?Sized,
{
    while let Some(request) = queue.recv().await {
        let id = request.id();

        stats.enter();
        let response = execute(exchange.as_ref(), request).await;
        stats.leave();

        debug!(
            execution_id = id,
            worker,
            status = response.status.as_str(),
            latency_ms = response.outside_execution.as_millis() as u64,
            "Request executed"
        );

        if out.send(response).await.is_err() {
            return Err(ExecError::protocol(format!(
                "dispatcher output closed while worker {} held response {}",
                worker, id
            )));
        }
    }

    debug!(worker, "Dispatcher worker drained");
    Ok(())
}

/// Execute one request against the exchange.
///
/// `Execute` requests past their deadline short-circuit to `TimedOut`
/// without calling the exchange.
pub async fn execute<E>(exchange: &E, request: ExecRequest) -> ExecResponse
where
    E: ExchangePort + ?Sized,
{
    let started = Instant::now();

    let mut response = match request.what {
        ExecType::Execute => {
            if request.cmd.is_expired(Utc::now()) {
                return ExecResponse::timed_out(request, DEADLINE_PASSED);
            }
            exchange.trade(request).await
        },
        ExecType::Check => exchange.check(request).await,
        ExecType::Info => exchange.info(request).await,
    };

    if response.outside_execution.is_zero() {
        response.outside_execution = started.elapsed();
    }
    response
}

// =============================================================================
// Tests
// =============================================================================
