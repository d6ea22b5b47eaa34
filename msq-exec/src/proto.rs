//! Internal message protocol.
//!
//! Every queue between Coordinator, Dispatcher and Dumper carries one of two
//! messages: an [`ExecRequest`] travelling towards the exchange, or an
//! [`ExecResponse`] travelling back. Both own their Command, so a message is
//! never shared between tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use msq_domain::{Balance, Command, CommandId, Dictionaries, Order, RawCommand};

use crate::error::{ExecError, ExecResult};

// =============================================================================
// Enumerations
// =============================================================================

/// What the exchange should do with a command.
///
/// Serialized as its numeric wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum ExecType {
    /// Place the order
    Execute,
    /// Look up the outcome of an order placed earlier (idempotent)
    Check,
    /// Query account balances
    Info,
}

/// Outcome of an exchange interaction.
///
/// Serialized as its numeric wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum Status {
    /// The call failed (transport, exchange error, unfilled order)
    Error,
    /// The call succeeded
    Ok,
    /// The deadline passed before the call was made
    TimedOut,
    /// The exchange refused the command
    Rejected,
}

impl From<ExecType> for i16 {
    fn from(what: ExecType) -> i16 {
        match what {
            ExecType::Execute => 1,
            ExecType::Check => 2,
            ExecType::Info => 3,
        }
    }
}

impl TryFrom<i16> for ExecType {
    type Error = ExecError;

    fn try_from(code: i16) -> ExecResult<Self> {
        match code {
            1 => Ok(ExecType::Execute),
            2 => Ok(ExecType::Check),
            3 => Ok(ExecType::Info),
            other => Err(ExecError::protocol(format!("unknown exec type code {}", other))),
        }
    }
}

impl From<Status> for i16 {
    fn from(status: Status) -> i16 {
        match status {
            Status::Error => 1,
            Status::Ok => 2,
            Status::TimedOut => 3,
            Status::Rejected => 4,
        }
    }
}

impl TryFrom<i16> for Status {
    type Error = ExecError;

    fn try_from(code: i16) -> ExecResult<Self> {
        match code {
            1 => Ok(Status::Error),
            2 => Ok(Status::Ok),
            3 => Ok(Status::TimedOut),
            4 => Ok(Status::Rejected),
            other => Err(ExecError::protocol(format!("unknown status code {}", other))),
        }
    }
}

impl Status {
    /// Lower-case label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Error => "error",
            Status::Ok => "ok",
            Status::TimedOut => "timed_out",
            Status::Rejected => "rejected",
        }
    }
}

// =============================================================================
// ExecRequest
// =============================================================================

/// A command on its way to an exchange worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub what: ExecType,
    pub cmd: Command,
    /// String projection of `cmd`, with dictionary names resolved
    pub raw: RawCommand,
}

impl ExecRequest {
    /// Build a request, projecting the command through the dictionaries.
    pub fn new(what: ExecType, cmd: Command, dictionaries: &Dictionaries) -> Self {
        let raw = RawCommand::project(&cmd, dictionaries);
        Self { what, cmd, raw }
    }

    /// Id of the command carried by this request
    pub fn id(&self) -> CommandId {
        self.cmd.id
    }

    /// Reject requests that cannot have come from a claim.
    ///
    /// # Errors
    /// Returns `ExecError::ProtocolViolation` if the projection does not match
    /// the command or the command has no owning connector.
    pub fn validate(&self) -> ExecResult<()> {
        if self.raw.id != self.cmd.id.to_string() {
            return Err(ExecError::protocol(format!(
                "request projection id '{}' does not match command {}",
                self.raw.id, self.cmd.id
            )));
        }
        if self.cmd.connector_id.is_none() {
            return Err(ExecError::protocol(format!(
                "request for command {} was not claimed by a connector",
                self.cmd.id
            )));
        }
        Ok(())
    }
}

// =============================================================================
// ExecResponse
// =============================================================================

/// Result of one exchange interaction, carrying its originating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub request: ExecRequest,
    pub status: Status,
    pub description: String,
    pub order: Option<Order>,
    pub balances: Option<Vec<Balance>>,
    /// Time spent inside the exchange call
    pub outside_execution: Duration,
}

impl ExecResponse {
    /// Create a response with no attachments.
    pub fn new(request: ExecRequest, status: Status, description: impl Into<String>) -> Self {
        Self {
            request,
            status,
            description: description.into(),
            order: None,
            balances: None,
            outside_execution: Duration::ZERO,
        }
    }

    /// Successful response
    pub fn ok(request: ExecRequest) -> Self {
        Self::new(request, Status::Ok, "")
    }

    /// Failed response
    pub fn error(request: ExecRequest, description: impl Into<String>) -> Self {
        Self::new(request, Status::Error, description)
    }

    /// Deadline-exceeded response
    pub fn timed_out(request: ExecRequest, description: impl Into<String>) -> Self {
        Self::new(request, Status::TimedOut, description)
    }

    /// Exchange refusal
    pub fn rejected(request: ExecRequest, description: impl Into<String>) -> Self {
        Self::new(request, Status::Rejected, description)
    }

    /// Attach the placed order
    pub fn with_order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    /// Attach account balances
    pub fn with_balances(mut self, balances: Vec<Balance>) -> Self {
        self.balances = Some(balances);
        self
    }

    /// Record exchange-side latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.outside_execution = latency;
        self
    }

    /// Id of the command this response belongs to
    pub fn id(&self) -> CommandId {
        self.request.cmd.id
    }

    /// Whether the originating request was of the given type
    pub fn is(&self, what: ExecType) -> bool {
        self.request.what == what
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    fn command(id: CommandId) -> Command {
        let now = Utc::now();
        Command {
            id,
            exchange_id: 1,
            instrument_name: "ABC".to_string(),
            direction_id: 1,
            order_type_id: 1,
            limit_price: None,
            amount: Some(dec!(10)),
            status_id: 2,
            connector_id: Some(1),
            execution_type_id: 1,
            execute_till: now + ChronoDuration::seconds(60),
            ref_position_id: None,
            time_in_force_id: 1,
            update_timestamp: now,
            account_id: 1,
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            fingerprint: format!("fp-{}", id),
        }
    }

    #[test]
    fn test_enums_travel_as_wire_codes() {
        let request = ExecRequest::new(ExecType::Check, command(5), &Dictionaries::builtin());
        let response = ExecResponse::rejected(request, "closed");

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["request"]["what"], 2);
        assert_eq!(json["status"], 4);

        let decoded: ExecResponse = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_unknown_wire_code_is_rejected() {
        assert!(matches!(ExecType::try_from(0i16), Err(ExecError::ProtocolViolation(_))));
        assert!(matches!(Status::try_from(9i16), Err(ExecError::ProtocolViolation(_))));

        let request = ExecRequest::new(ExecType::Execute, command(5), &Dictionaries::builtin());
        let mut json = serde_json::to_value(&request).unwrap();
        json["what"] = serde_json::json!(7);
        let err = serde_json::from_value::<ExecRequest>(json).unwrap_err();
        assert!(err.to_string().contains("unknown exec type code 7"));
    }

    #[test]
    fn test_request_projects_command() {
        let request = ExecRequest::new(ExecType::Execute, command(5), &Dictionaries::builtin());
        assert_eq!(request.id(), 5);
        assert_eq!(request.raw.exchange, "BINANCE");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_projection() {
        let mut request = ExecRequest::new(ExecType::Check, command(5), &Dictionaries::builtin());
        request.raw.id = "6".to_string();
        assert!(matches!(request.validate(), Err(ExecError::ProtocolViolation(_))));
    }

    #[test]
    fn test_validate_rejects_unclaimed_command() {
        let mut cmd = command(8);
        cmd.connector_id = None;
        let request = ExecRequest::new(ExecType::Execute, cmd, &Dictionaries::builtin());
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_response_builders() {
        let request = ExecRequest::new(ExecType::Info, command(3), &Dictionaries::builtin());
        let response = ExecResponse::ok(request)
            .with_balances(vec![Balance {
                asset: "USDT".to_string(),
                free: dec!(100),
                locked: dec!(0),
            }])
            .with_latency(std::time::Duration::from_millis(12));

        assert_eq!(response.status, Status::Ok);
        assert!(response.is(ExecType::Info));
        assert_eq!(response.id(), 3);
        assert_eq!(response.balances.as_ref().map(Vec::len), Some(1));
        assert!(response.order.is_none());
    }
}
