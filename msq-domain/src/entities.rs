//! Domain Entities for the MSQ execution engine
//!
//! The Command is the unit of work; Order and Balance are the immutable
//! outcomes attached when a Command completes; HistoryEntry records every
//! status transition.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dictionaries::DictId;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a Command (execution row)
pub type CommandId = i64;

/// Identifier of an exchange (exchange dictionary id)
pub type ExchangeId = DictId;

/// Identifier of a connector process
pub type ConnectorId = i16;

/// Identifier of the owning account
pub type AccountId = i64;

// =============================================================================
// Command
// =============================================================================

/// A persisted request to trade on, check, or query an exchange.
///
/// Reference fields (`exchange_id`, `direction_id`, ...) are dictionary ids.
/// Credentials travel with the command and are redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub exchange_id: ExchangeId,
    pub instrument_name: String,
    pub direction_id: DictId,
    pub order_type_id: DictId,
    pub limit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub status_id: DictId,
    /// Set exactly when the command is EXECUTING or finished via EXECUTING
    pub connector_id: Option<ConnectorId>,
    pub execution_type_id: DictId,
    /// Deadline for execution
    pub execute_till: DateTime<Utc>,
    pub ref_position_id: Option<String>,
    pub time_in_force_id: DictId,
    pub update_timestamp: DateTime<Utc>,
    pub account_id: AccountId,
    pub api_key: String,
    pub secret_key: String,
    /// Idempotency key, unique across all commands
    pub fingerprint: String,
}

impl Command {
    /// Whether the deadline is before `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.execute_till < now
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("exchange_id", &self.exchange_id)
            .field("instrument_name", &self.instrument_name)
            .field("direction_id", &self.direction_id)
            .field("order_type_id", &self.order_type_id)
            .field("limit_price", &self.limit_price)
            .field("amount", &self.amount)
            .field("status_id", &self.status_id)
            .field("connector_id", &self.connector_id)
            .field("execution_type_id", &self.execution_type_id)
            .field("execute_till", &self.execute_till)
            .field("ref_position_id", &self.ref_position_id)
            .field("time_in_force_id", &self.time_in_force_id)
            .field("update_timestamp", &self.update_timestamp)
            .field("account_id", &self.account_id)
            .field("api_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// A validated command ready to be inserted in CREATED.
///
/// Produced by ingestion after dictionary resolution; the store assigns the
/// id, status and timestamps.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCommand {
    pub exchange_id: ExchangeId,
    pub instrument_name: String,
    pub direction_id: DictId,
    pub order_type_id: DictId,
    pub limit_price: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub execution_type_id: DictId,
    pub execute_till: DateTime<Utc>,
    pub ref_position_id: Option<String>,
    pub time_in_force_id: DictId,
    pub account_id: AccountId,
    pub api_key: String,
    pub secret_key: String,
    pub fingerprint: String,
}

impl fmt::Debug for NewCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCommand")
            .field("exchange_id", &self.exchange_id)
            .field("instrument_name", &self.instrument_name)
            .field("direction_id", &self.direction_id)
            .field("order_type_id", &self.order_type_id)
            .field("limit_price", &self.limit_price)
            .field("amount", &self.amount)
            .field("execute_till", &self.execute_till)
            .field("account_id", &self.account_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Exchange order produced by a successful trade or check. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order id assigned by the exchange
    pub external_order_id: i64,
    /// Command the order belongs to
    pub execution_id: CommandId,
    pub price: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
}

/// Account balance of one asset, reported by an info request. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// One status transition of a Command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub execution_id: CommandId,
    /// `None` for the initial insert
    pub from_status_id: Option<DictId>,
    pub to_status_id: DictId,
    pub timestamp: DateTime<Utc>,
    pub description: Option<String>,
}

/// Read-by-id view: a Command with whatever outcomes were persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Command,
    pub order: Option<Order>,
    pub balances: Vec<Balance>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn sample() -> Command {
        let now = Utc::now();
        Command {
            id: 7,
            exchange_id: 1,
            instrument_name: "ABC".to_string(),
            direction_id: 1,
            order_type_id: 1,
            limit_price: None,
            amount: Some(dec!(10)),
            status_id: 1,
            connector_id: None,
            execution_type_id: 1,
            execute_till: now + Duration::seconds(60),
            ref_position_id: None,
            time_in_force_id: 1,
            update_timestamp: now,
            account_id: 42,
            api_key: "key-123".to_string(),
            secret_key: "secret-456".to_string(),
            fingerprint: "fp-1".to_string(),
        }
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let debug = format!("{:?}", sample());
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("key-123"));
        assert!(!debug.contains("secret-456"));
        assert!(debug.contains("fp-1"));
    }

    #[test]
    fn test_is_expired() {
        let cmd = sample();
        assert!(!cmd.is_expired(Utc::now()));
        assert!(cmd.is_expired(cmd.execute_till + Duration::milliseconds(1)));
    }

    #[test]
    fn test_order_serialization() {
        let order = Order {
            external_order_id: 991,
            execution_id: 7,
            price: dec!(101.25),
            commission: dec!(0.01),
            commission_asset: "BNB".to_string(),
        };

        let json = serde_json::to_string(&order).unwrap();
        let parsed: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, order);
    }
}
