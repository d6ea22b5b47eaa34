//! In-memory store implementation
//!
//! Used for testing and development without a database. Every operation runs
//! under one lock, which gives it the same all-or-nothing behaviour as a
//! database transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use msq_domain::{
    Balance, Command, CommandId, CommandRecord, CommandStatus, ConnectorId, Dictionaries,
    ExchangeId, HistoryEntry, NewCommand, Order, StatusIds,
};

use crate::error::StoreError;
use crate::repository::{CommandStore, Finish, EXPIRED_DESCRIPTION};

/// In-memory command store
pub struct MemoryStore {
    state: Mutex<State>,
    dictionaries: Dictionaries,
    statuses: StatusIds,
    /// Number of upcoming operations that fail with a connection error
    injected_failures: AtomicUsize,
}

#[derive(Default)]
struct State {
    commands: BTreeMap<CommandId, Command>,
    fingerprints: HashMap<String, CommandId>,
    history: Vec<HistoryEntry>,
    orders: HashMap<CommandId, Order>,
    balances: HashMap<CommandId, Vec<Balance>>,
    last_id: CommandId,
}

impl MemoryStore {
    /// Create an empty store using the builtin dictionaries
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            dictionaries: Dictionaries::builtin(),
            statuses: StatusIds::builtin(),
            injected_failures: AtomicUsize::new(0),
        }
    }

    /// Status ids used by this store
    pub fn statuses(&self) -> StatusIds {
        self.statuses
    }

    /// Make the next `count` operations fail with `StoreError::Connection`.
    pub fn fail_next(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Insert a command exactly as given (any status, any timestamps).
    ///
    /// Used to reproduce states left behind by a crash.
    pub fn seed(&self, command: Command) -> Result<CommandId, StoreError> {
        let mut state = self.lock()?;
        if state.fingerprints.contains_key(&command.fingerprint) {
            return Err(StoreError::duplicate("execution", command.fingerprint));
        }
        let id = command.id;
        state.last_id = state.last_id.max(id);
        state.fingerprints.insert(command.fingerprint.clone(), id);
        state.commands.insert(id, command);
        Ok(id)
    }

    /// Current snapshot of a command
    pub fn command(&self, id: CommandId) -> Option<Command> {
        self.lock().ok().and_then(|state| state.commands.get(&id).cloned())
    }

    /// Current status of a command
    pub fn status_of(&self, id: CommandId) -> Option<CommandStatus> {
        self.command(id).and_then(|cmd| self.statuses.status(cmd.status_id))
    }

    /// Number of stored commands
    pub fn command_count(&self) -> usize {
        self.lock().map(|state| state.commands.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::Database(format!("memory store lock poisoned: {}", e)))
    }

    fn check_injected_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Connection("simulated store outage".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn record_history(
        state: &mut State,
        execution_id: CommandId,
        from: Option<i16>,
        to: i16,
        description: Option<String>,
        timestamp: DateTime<Utc>,
    ) {
        state.history.push(HistoryEntry {
            execution_id,
            from_status_id: from,
            to_status_id: to,
            timestamp,
            description,
        });
    }

    /// `finish` against an already locked state.
    fn finish_locked(
        &self,
        state: &mut State,
        finish: Finish,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        finish
            .from
            .transition_to(finish.to)
            .map_err(|e| StoreError::invalid_state(e.to_string()))?;

        let from_id = self.statuses.id(finish.from);
        let to_id = self.statuses.id(finish.to);

        let command = state
            .commands
            .get_mut(&finish.execution_id)
            .ok_or_else(|| StoreError::not_found("execution", finish.execution_id.to_string()))?;

        if command.status_id != from_id {
            let current = self
                .statuses
                .status(command.status_id)
                .map(|s| s.name())
                .unwrap_or("UNKNOWN");
            return Err(StoreError::invalid_state(format!(
                "execution {} is {}, expected {}",
                finish.execution_id, current, finish.from
            )));
        }

        command.status_id = to_id;
        if finish.connector_id.is_some() {
            command.connector_id = finish.connector_id;
        }
        command.update_timestamp = now;

        Self::record_history(
            state,
            finish.execution_id,
            Some(from_id),
            to_id,
            Some(finish.description),
            now,
        );
        if let Some(order) = finish.order {
            state.orders.insert(finish.execution_id, order);
        }
        if !finish.balances.is_empty() {
            state.balances.entry(finish.execution_id).or_default().extend(finish.balances);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn insert_command(&self, new: NewCommand) -> Result<CommandId, StoreError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;

        if let Some(existing) = state.fingerprints.get(&new.fingerprint) {
            return Ok(*existing);
        }

        let now = Utc::now();
        let created = self.statuses.id(CommandStatus::Created);
        state.last_id += 1;
        let id = state.last_id;

        let command = Command {
            id,
            exchange_id: new.exchange_id,
            instrument_name: new.instrument_name,
            direction_id: new.direction_id,
            order_type_id: new.order_type_id,
            limit_price: new.limit_price,
            amount: new.amount,
            status_id: created,
            connector_id: None,
            execution_type_id: new.execution_type_id,
            execute_till: new.execute_till,
            ref_position_id: new.ref_position_id,
            time_in_force_id: new.time_in_force_id,
            update_timestamp: now,
            account_id: new.account_id,
            api_key: new.api_key,
            secret_key: new.secret_key,
            fingerprint: new.fingerprint,
        };

        state.fingerprints.insert(command.fingerprint.clone(), id);
        state.commands.insert(id, command);
        Self::record_history(&mut state, id, None, created, None, now);
        Ok(id)
    }

    async fn claim_for_execution(
        &self,
        exchange_id: ExchangeId,
        connector_id: ConnectorId,
        not_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;

        let now = Utc::now();
        let created = self.statuses.id(CommandStatus::Created);
        let executing = self.statuses.id(CommandStatus::Executing);

        let ids: Vec<CommandId> = state
            .commands
            .values()
            .filter(|c| {
                c.exchange_id == exchange_id
                    && c.status_id == created
                    && c.connector_id.is_none()
                    && c.execute_till > not_after
            })
            .take(limit.max(0) as usize)
            .map(|c| c.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(command) = state.commands.get_mut(&id) {
                command.status_id = executing;
                command.connector_id = Some(connector_id);
                command.update_timestamp = now;
                claimed.push(command.clone());
            }
            Self::record_history(&mut state, id, Some(created), executing, None, now);
        }
        Ok(claimed)
    }

    async fn claim_for_recovery(
        &self,
        exchange_id: ExchangeId,
        connector_id: ConnectorId,
        older_than: DateTime<Utc>,
    ) -> Result<Option<Command>, StoreError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;
        let executing = self.statuses.id(CommandStatus::Executing);

        let stale = state.commands.values_mut().find(|c| {
            c.exchange_id == exchange_id
                && c.status_id == executing
                && c.connector_id == Some(connector_id)
                && c.update_timestamp < older_than
        });

        Ok(stale.map(|command| {
            command.update_timestamp = Utc::now();
            command.clone()
        }))
    }

    async fn finish(&self, finish: Finish) -> Result<(), StoreError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;
        self.finish_locked(&mut state, finish, Utc::now())
    }

    async fn expire_stale(
        &self,
        baseline: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>, StoreError> {
        self.check_injected_failure()?;
        let mut state = self.lock()?;
        let created = self.statuses.id(CommandStatus::Created);

        let stale: Vec<CommandId> = state
            .commands
            .values()
            .filter(|c| c.status_id == created && c.execute_till < baseline)
            .take(limit.max(0) as usize)
            .map(|c| c.id)
            .collect();

        let now = Utc::now();
        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            let finish = Finish::transition(
                id,
                CommandStatus::Created,
                CommandStatus::TimedOut,
                EXPIRED_DESCRIPTION,
            );
            self.finish_locked(&mut state, finish, now)?;
            if let Some(command) = state.commands.get(&id) {
                expired.push(command.clone());
            }
        }
        Ok(expired)
    }

    async fn load_by_id(&self, id: CommandId) -> Result<Option<CommandRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state.commands.get(&id).map(|command| CommandRecord {
            command: command.clone(),
            order: state.orders.get(&id).cloned(),
            balances: state.balances.get(&id).cloned().unwrap_or_default(),
        }))
    }

    async fn history(&self, id: CommandId) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.lock()?;
        Ok(state.history.iter().filter(|h| h.execution_id == id).cloned().collect())
    }

    async fn load_dictionaries(&self) -> Result<Dictionaries, StoreError> {
        Ok(self.dictionaries.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_injected_failure()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn new_command(fingerprint: &str, deadline: DateTime<Utc>) -> NewCommand {
        NewCommand {
            exchange_id: 1,
            instrument_name: "ABC".to_string(),
            direction_id: 1,
            order_type_id: 1,
            limit_price: None,
            amount: Some(dec!(10)),
            execution_type_id: 1,
            execute_till: deadline,
            ref_position_id: None,
            time_in_force_id: 1,
            account_id: 7,
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    fn in_a_minute() -> DateTime<Utc> {
        Utc::now() + Duration::seconds(60)
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_on_fingerprint() {
        let store = MemoryStore::new();

        let first = store.insert_command(new_command("fp-1", in_a_minute())).await.unwrap();
        let second = store.insert_command(new_command("fp-1", in_a_minute())).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.command_count(), 1);
        assert_eq!(store.status_of(first), Some(CommandStatus::Created));

        let history = store.history(first).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status_id, None);
    }

    #[tokio::test]
    async fn test_claim_moves_to_executing_once() {
        let store = MemoryStore::new();
        let id = store.insert_command(new_command("fp-1", in_a_minute())).await.unwrap();

        let claimed = store.claim_for_execution(1, 3, Utc::now(), 1).await.unwrap();
        let again = store.claim_for_execution(1, 3, Utc::now(), 1).await.unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].connector_id, Some(3));
        assert_eq!(claimed[0].status_id, store.statuses().id(CommandStatus::Executing));
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_claim_filters_exchange_and_deadline() {
        let store = MemoryStore::new();
        let mut other_exchange = new_command("fp-ex", in_a_minute());
        other_exchange.exchange_id = 2;
        store.insert_command(other_exchange).await.unwrap();
        store.insert_command(new_command("fp-late", Utc::now() - Duration::seconds(30))).await.unwrap();

        let claimed = store.claim_for_execution(1, 1, Utc::now(), 10).await.unwrap();

        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_limit() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store.insert_command(new_command(&format!("fp-{n}"), in_a_minute())).await.unwrap();
        }

        let claimed = store.claim_for_execution(1, 1, Utc::now(), 2).await.unwrap();

        assert_eq!(claimed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_finish_attaches_order_and_rejects_replay() {
        let store = MemoryStore::new();
        let id = store.insert_command(new_command("fp-1", in_a_minute())).await.unwrap();
        store.claim_for_execution(1, 1, Utc::now(), 1).await.unwrap();

        let order = Order {
            external_order_id: 55,
            execution_id: id,
            price: dec!(100),
            commission: dec!(1),
            commission_asset: "BNB".to_string(),
        };
        let mut finish =
            Finish::transition(id, CommandStatus::Executing, CommandStatus::Completed, "");
        finish.connector_id = Some(1);
        finish.order = Some(order.clone());

        store.finish(finish.clone()).await.unwrap();
        let replay = store.finish(finish).await;

        let record = store.load_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.order, Some(order));
        assert_eq!(store.status_of(id), Some(CommandStatus::Completed));
        assert!(matches!(replay, Err(StoreError::InvalidState { .. })));
        assert_eq!(store.history(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_finish_rejects_skipping_executing() {
        let store = MemoryStore::new();
        let id = store.insert_command(new_command("fp-1", in_a_minute())).await.unwrap();

        let result = store
            .finish(Finish::transition(id, CommandStatus::Created, CommandStatus::Completed, ""))
            .await;

        assert!(matches!(result, Err(StoreError::InvalidState { .. })));
        assert_eq!(store.status_of(id), Some(CommandStatus::Created));
    }

    #[tokio::test]
    async fn test_finish_unknown_command() {
        let store = MemoryStore::new();
        let result = store
            .finish(Finish::transition(99, CommandStatus::Executing, CommandStatus::Error, "boom"))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_claim_for_recovery_only_stale_owned_rows() {
        let store = MemoryStore::new();
        let id = store.insert_command(new_command("fp-1", in_a_minute())).await.unwrap();
        store.claim_for_execution(1, 4, Utc::now(), 1).await.unwrap();

        // Fresh row: not yet stale.
        let none = store.claim_for_recovery(1, 4, Utc::now() - Duration::seconds(30)).await.unwrap();
        assert!(none.is_none());

        // Other connector never sees it.
        let later = Utc::now() + Duration::seconds(1);
        assert!(store.claim_for_recovery(1, 5, later).await.unwrap().is_none());

        let recovered = store.claim_for_recovery(1, 4, later).await.unwrap().unwrap();
        assert_eq!(recovered.id, id);
        assert_eq!(store.status_of(id), Some(CommandStatus::Executing));
    }

    #[tokio::test]
    async fn test_expire_stale_in_batches() {
        let store = MemoryStore::new();
        let past = Utc::now() - Duration::seconds(5);
        for n in 0..3 {
            store.insert_command(new_command(&format!("old-{n}"), past)).await.unwrap();
        }
        let fresh = store.insert_command(new_command("fresh", in_a_minute())).await.unwrap();

        let first = store.expire_stale(Utc::now(), 2).await.unwrap();
        let second = store.expire_stale(Utc::now(), 2).await.unwrap();
        let third = store.expire_stale(Utc::now(), 2).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());
        assert_eq!(store.status_of(fresh), Some(CommandStatus::Created));

        let history = store.history(first[0].id).await.unwrap();
        assert_eq!(history.last().unwrap().description.as_deref(), Some(EXPIRED_DESCRIPTION));
        assert_eq!(first[0].connector_id, None);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.fail_next(2);

        assert!(store.ping().await.unwrap_err().is_transient());
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());
    }
}
