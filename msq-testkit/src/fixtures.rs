//! Command fixtures.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use msq_domain::{
    names, AccountId, Command, CommandId, CommandStatus, ConnectorId, Dictionaries, ExchangeId,
    NewCommand, StatusIds,
};

static NEXT_FINGERPRINT: AtomicU64 = AtomicU64::new(1);

/// Builder for commands expressed with dictionary names.
///
/// Ids are resolved through [`Dictionaries::builtin`], which matches the
/// seeded migration rows.
#[derive(Debug, Clone)]
pub struct CommandFixture {
    exchange: String,
    instrument: String,
    direction: String,
    order_type: String,
    limit_price: Option<Decimal>,
    amount: Option<Decimal>,
    execution_type: String,
    time_in_force: String,
    execute_till: DateTime<Utc>,
    account_id: AccountId,
    fingerprint: String,
}

impl CommandFixture {
    /// BUY MARKET `amount` of `instrument` on BINANCE, deadline in 60s.
    pub fn market_buy(instrument: &str, amount: Decimal) -> Self {
        Self {
            exchange: names::exchange::BINANCE.to_string(),
            instrument: instrument.to_string(),
            direction: names::direction::BUY.to_string(),
            order_type: names::order_type::MARKET.to_string(),
            limit_price: None,
            amount: Some(amount),
            execution_type: names::execution_type::OPEN.to_string(),
            time_in_force: names::time_in_force::GTC.to_string(),
            execute_till: Utc::now() + Duration::seconds(60),
            account_id: 1,
            fingerprint: format!("fixture-{}", NEXT_FINGERPRINT.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Balance query on BINANCE, deadline in 60s.
    pub fn info() -> Self {
        Self {
            direction: names::direction::ACCOUNT.to_string(),
            order_type: names::order_type::INFO.to_string(),
            execution_type: names::execution_type::REQUEST.to_string(),
            amount: None,
            ..Self::market_buy("", Decimal::ZERO)
        }
    }

    /// Use a limit order at `price`
    pub fn limit(mut self, price: Decimal) -> Self {
        self.order_type = names::order_type::LIMIT.to_string();
        self.limit_price = Some(price);
        self
    }

    /// Set the exchange by name
    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange = name.to_string();
        self
    }

    /// Deadline relative to now (negative for the past)
    pub fn deadline_in(mut self, offset: Duration) -> Self {
        self.execute_till = Utc::now() + offset;
        self
    }

    /// Set the idempotency fingerprint
    pub fn fingerprint(mut self, fingerprint: &str) -> Self {
        self.fingerprint = fingerprint.to_string();
        self
    }

    /// Set the owning account
    pub fn account(mut self, account_id: AccountId) -> Self {
        self.account_id = account_id;
        self
    }

    /// Exchange id of this fixture
    pub fn exchange_id(&self) -> ExchangeId {
        Dictionaries::builtin().exchanges().id_by_name(&self.exchange)
    }

    /// Command ready for `CommandStore::insert_command`
    pub fn new_command(&self) -> NewCommand {
        let dicts = Dictionaries::builtin();
        NewCommand {
            exchange_id: dicts.exchanges().id_by_name(&self.exchange),
            instrument_name: self.instrument.clone(),
            direction_id: dicts.directions().id_by_name(&self.direction),
            order_type_id: dicts.order_types().id_by_name(&self.order_type),
            limit_price: self.limit_price,
            amount: self.amount,
            execution_type_id: dicts.execution_types().id_by_name(&self.execution_type),
            execute_till: self.execute_till,
            ref_position_id: None,
            time_in_force_id: dicts.time_in_force().id_by_name(&self.time_in_force),
            account_id: self.account_id,
            api_key: "test-api-key".to_string(),
            secret_key: "test-secret-key".to_string(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    /// Fully materialized command in any state, e.g. one left EXECUTING by a
    /// crashed connector.
    pub fn command(
        &self,
        id: CommandId,
        status: CommandStatus,
        connector_id: Option<ConnectorId>,
        update_timestamp: DateTime<Utc>,
    ) -> Command {
        let new = self.new_command();
        Command {
            id,
            exchange_id: new.exchange_id,
            instrument_name: new.instrument_name,
            direction_id: new.direction_id,
            order_type_id: new.order_type_id,
            limit_price: new.limit_price,
            amount: new.amount,
            status_id: StatusIds::builtin().id(status),
            connector_id,
            execution_type_id: new.execution_type_id,
            execute_till: new.execute_till,
            ref_position_id: new.ref_position_id,
            time_in_force_id: new.time_in_force_id,
            update_timestamp,
            account_id: new.account_id,
            api_key: new.api_key,
            secret_key: new.secret_key,
            fingerprint: new.fingerprint,
        }
    }
}
