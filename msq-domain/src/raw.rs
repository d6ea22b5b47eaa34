//! Raw string projection of a Command.
//!
//! Exchange capability providers receive every field as a string with
//! dictionary ids already resolved to names, so they never need the
//! dictionaries themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dictionaries::Dictionaries;
use crate::entities::Command;

const MASK: &str = "***";

/// Every Command field rendered as a string.
///
/// Absent optional values render as `""`. Timestamps use RFC 3339.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommand {
    pub id: String,
    pub exchange: String,
    pub instrument: String,
    pub direction: String,
    pub order_type: String,
    pub limit_price: String,
    pub amount: String,
    pub status: String,
    pub connector_id: String,
    pub execution_type: String,
    pub execute_till: String,
    pub ref_position_id: String,
    pub time_in_force: String,
    pub update_time: String,
    pub account_id: String,
    pub api_key: String,
    pub secret_key: String,
    pub fingerprint: String,
}

impl RawCommand {
    /// Project a command through the dictionaries.
    ///
    /// Unknown dictionary ids project to an empty name.
    pub fn project(cmd: &Command, dictionaries: &Dictionaries) -> Self {
        Self {
            id: cmd.id.to_string(),
            exchange: dictionaries.exchanges().name_by_id(cmd.exchange_id).to_string(),
            instrument: cmd.instrument_name.clone(),
            direction: dictionaries.directions().name_by_id(cmd.direction_id).to_string(),
            order_type: dictionaries.order_types().name_by_id(cmd.order_type_id).to_string(),
            limit_price: cmd.limit_price.map(|p| p.to_string()).unwrap_or_default(),
            amount: cmd.amount.map(|a| a.to_string()).unwrap_or_default(),
            status: dictionaries.execution_statuses().name_by_id(cmd.status_id).to_string(),
            connector_id: cmd.connector_id.map(|c| c.to_string()).unwrap_or_default(),
            execution_type: dictionaries
                .execution_types()
                .name_by_id(cmd.execution_type_id)
                .to_string(),
            execute_till: cmd.execute_till.to_rfc3339(),
            ref_position_id: cmd.ref_position_id.clone().unwrap_or_default(),
            time_in_force: dictionaries.time_in_force().name_by_id(cmd.time_in_force_id).to_string(),
            update_time: cmd.update_timestamp.to_rfc3339(),
            account_id: cmd.account_id.to_string(),
            api_key: cmd.api_key.clone(),
            secret_key: cmd.secret_key.clone(),
            fingerprint: cmd.fingerprint.clone(),
        }
    }

    /// Copy with credentials masked, for views leaving the process.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: MASK.to_string(),
            secret_key: MASK.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for RawCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCommand")
            .field("id", &self.id)
            .field("exchange", &self.exchange)
            .field("instrument", &self.instrument)
            .field("direction", &self.direction)
            .field("order_type", &self.order_type)
            .field("limit_price", &self.limit_price)
            .field("amount", &self.amount)
            .field("status", &self.status)
            .field("connector_id", &self.connector_id)
            .field("execute_till", &self.execute_till)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn command() -> Command {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Command {
            id: 15,
            exchange_id: 1,
            instrument_name: "BTCUSDT".to_string(),
            direction_id: 2,
            order_type_id: 2,
            limit_price: Some(dec!(64000.5)),
            amount: Some(dec!(0.25)),
            status_id: 2,
            connector_id: Some(3),
            execution_type_id: 1,
            execute_till: ts,
            ref_position_id: Some("pos-9".to_string()),
            time_in_force_id: 1,
            update_timestamp: ts,
            account_id: 77,
            api_key: "k".to_string(),
            secret_key: "s".to_string(),
            fingerprint: "fp".to_string(),
        }
    }

    #[test]
    fn test_project_resolves_names() {
        let raw = RawCommand::project(&command(), &Dictionaries::builtin());

        assert_eq!(raw.id, "15");
        assert_eq!(raw.exchange, "BINANCE");
        assert_eq!(raw.direction, "SELL");
        assert_eq!(raw.order_type, "LIMIT");
        assert_eq!(raw.limit_price, "64000.5");
        assert_eq!(raw.amount, "0.25");
        assert_eq!(raw.status, "EXECUTING");
        assert_eq!(raw.connector_id, "3");
        assert_eq!(raw.execution_type, "OPEN");
        assert_eq!(raw.time_in_force, "GTC");
        assert_eq!(raw.execute_till, "2024-03-01T12:00:00+00:00");
        assert_eq!(raw.ref_position_id, "pos-9");
    }

    #[test]
    fn test_project_absent_values_and_unknown_ids() {
        let mut cmd = command();
        cmd.limit_price = None;
        cmd.connector_id = None;
        cmd.ref_position_id = None;
        cmd.direction_id = 99;

        let raw = RawCommand::project(&cmd, &Dictionaries::builtin());

        assert_eq!(raw.limit_price, "");
        assert_eq!(raw.connector_id, "");
        assert_eq!(raw.ref_position_id, "");
        assert_eq!(raw.direction, "");
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let raw = RawCommand::project(&command(), &Dictionaries::builtin()).redacted();
        assert_eq!(raw.api_key, "***");
        assert_eq!(raw.secret_key, "***");
        assert_eq!(raw.id, "15");
    }
}
