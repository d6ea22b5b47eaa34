//! Timeouter: expires CREATED commands whose deadline has passed.
//!
//! Runs independently of the Coordinator. Every `interval` it expires batches
//! until the store reports nothing left.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use msq_store::{CommandStore, StoreError};

use crate::config::TimeouterConfig;
use crate::error::DaemonResult;
use crate::metrics::EngineMetrics;

/// Stale command sweeper.
pub struct Timeouter<S: ?Sized> {
    store: Arc<S>,
    config: TimeouterConfig,
    metrics: EngineMetrics,
}

impl<S: CommandStore + ?Sized> Timeouter<S> {
    pub fn new(store: Arc<S>, config: TimeouterConfig, metrics: EngineMetrics) -> Self {
        Self { store, config, metrics }
    }

    /// Run the sweep loop until `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) -> DaemonResult<()> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Timeouter started"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // First tick is immediate

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Timeout sweep failed (will retry)");
                        self.metrics.store_error("timeouter");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                    }
                }
            }
        }

        info!("Timeouter stopped");
        Ok(())
    }

    /// Expire batches until none is left. Returns the number expired.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        loop {
            let expired = self.store.expire_stale(Utc::now(), self.config.batch_size).await?;
            if expired.is_empty() {
                break;
            }
            for cmd in &expired {
                info!(execution_id = cmd.id, execute_till = %cmd.execute_till, "Command timed out");
            }
            total += expired.len();
            self.metrics.commands_expired.inc_by(expired.len() as u64);
        }
        if total > 0 {
            debug!(total, "Timeout sweep finished");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msq_domain::CommandStatus;
    use msq_store::{MemoryStore, EXPIRED_DESCRIPTION};
    use msq_testkit::CommandFixture;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn config() -> TimeouterConfig {
        TimeouterConfig {
            interval: Duration::from_millis(10),
            batch_size: 2,
            error_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_sweep_expires_in_batches() {
        let store = Arc::new(MemoryStore::new());
        let mut expired_ids = Vec::new();
        for _ in 0..5 {
            let fixture = CommandFixture::market_buy("ABC", dec!(1))
                .deadline_in(chrono::Duration::seconds(-5));
            expired_ids.push(store.insert_command(fixture.new_command()).await.unwrap());
        }
        let live = store
            .insert_command(CommandFixture::market_buy("ABC", dec!(1)).new_command())
            .await
            .unwrap();

        let metrics = EngineMetrics::new().unwrap();
        let timeouter = Timeouter::new(Arc::clone(&store), config(), metrics.clone());

        assert_eq!(timeouter.sweep().await.unwrap(), 5);
        for id in expired_ids {
            assert_eq!(store.status_of(id), Some(CommandStatus::TimedOut));
            let history = store.history(id).await.unwrap();
            let last = history.last().unwrap();
            assert_eq!(last.description.as_deref(), Some(EXPIRED_DESCRIPTION));
        }
        assert_eq!(store.status_of(live), Some(CommandStatus::Created));
        assert_eq!(metrics.commands_expired.get(), 5);

        assert_eq!(timeouter.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_expires_and_survives_store_errors() {
        let store = Arc::new(MemoryStore::new());
        let id = store
            .insert_command(
                CommandFixture::market_buy("ABC", dec!(1))
                    .deadline_in(chrono::Duration::seconds(-1))
                    .new_command(),
            )
            .await
            .unwrap();
        store.fail_next(2);

        let metrics = EngineMetrics::new().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            Timeouter::new(Arc::clone(&store), config(), metrics.clone()).run(shutdown.clone()),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.status_of(id) != Some(CommandStatus::TimedOut) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(metrics.store_errors("timeouter"), 2);
    }
}
