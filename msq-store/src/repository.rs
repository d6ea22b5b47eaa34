//! Command store port.
//!
//! The store is the durable work queue: every status change of a Command
//! happens through one of these operations, each applied as a single unit of
//! work together with its history row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use msq_domain::{
    Balance, Command, CommandId, CommandRecord, CommandStatus, ConnectorId, Dictionaries,
    ExchangeId, HistoryEntry, NewCommand, Order,
};

use crate::error::StoreError;

/// History description recorded by the stale-command sweep.
pub const EXPIRED_DESCRIPTION: &str = "timed out without trying to execute";

/// Outcome to persist for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finish {
    pub execution_id: CommandId,
    /// Connector that handled the command (`None` leaves it unchanged)
    pub connector_id: Option<ConnectorId>,
    /// Status the row must currently be in
    pub from: CommandStatus,
    pub to: CommandStatus,
    pub description: String,
    pub order: Option<Order>,
    pub balances: Vec<Balance>,
}

impl Finish {
    /// Transition with no attachments
    pub fn transition(
        execution_id: CommandId,
        from: CommandStatus,
        to: CommandStatus,
        description: impl Into<String>,
    ) -> Self {
        Self {
            execution_id,
            connector_id: None,
            from,
            to,
            description: description.into(),
            order: None,
            balances: Vec::new(),
        }
    }
}

/// Durable command queue.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert a command in CREATED.
    ///
    /// Idempotent on the fingerprint: a resubmission returns the id of the
    /// existing row and inserts nothing.
    async fn insert_command(&self, command: NewCommand) -> Result<CommandId, StoreError>;

    /// Claim up to `limit` CREATED commands of `exchange_id` with no connector
    /// and a deadline later than `not_after`.
    ///
    /// Claimed rows move to EXECUTING owned by `connector_id`, with a fresh
    /// update timestamp and a history row. Concurrent claimers never receive
    /// the same row. An empty vector means there is no eligible work.
    async fn claim_for_execution(
        &self,
        exchange_id: ExchangeId,
        connector_id: ConnectorId,
        not_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError>;

    /// Claim one EXECUTING command owned by `connector_id` whose update
    /// timestamp is older than `older_than`.
    ///
    /// The timestamp is refreshed so the row is not picked again immediately;
    /// the status is unchanged.
    async fn claim_for_recovery(
        &self,
        exchange_id: ExchangeId,
        connector_id: ConnectorId,
        older_than: DateTime<Utc>,
    ) -> Result<Option<Command>, StoreError>;

    /// Move a command `from → to`, append history and attach the outcome.
    ///
    /// # Errors
    /// `StoreError::InvalidState` if the transition is illegal or the row is
    /// no longer in `from`; `StoreError::NotFound` if the row does not exist.
    async fn finish(&self, finish: Finish) -> Result<(), StoreError>;

    /// Expire up to `limit` CREATED commands whose deadline is before
    /// `baseline`, moving each to TIMED_OUT. Returns the expired commands;
    /// an empty vector means nothing is left to expire.
    async fn expire_stale(
        &self,
        baseline: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError>;

    /// Load a command with its Order and Balances.
    async fn load_by_id(&self, id: CommandId) -> Result<Option<CommandRecord>, StoreError>;

    /// Status history of a command, oldest first.
    async fn history(&self, id: CommandId) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Load the six reference dictionaries.
    async fn load_dictionaries(&self) -> Result<Dictionaries, StoreError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
