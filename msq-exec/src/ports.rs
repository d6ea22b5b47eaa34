//! Execution layer port definitions.
//!
//! The exchange is a black-box capability provider. Adapters for specific
//! venues implement [`ExchangePort`]; the engine never sees their wire
//! protocol.

use async_trait::async_trait;

use crate::proto::{ExecRequest, ExecResponse};

// =============================================================================
// Exchange Port
// =============================================================================

/// Port for exchange operations.
///
/// Each call consumes the request and returns a response that carries it
/// back. Implementations map every failure (transport, venue error, unfilled
/// order) to `Status::Error` with a description; they never return an error
/// value and must not panic.
///
/// Implementations:
/// - `StubExchange` - For testing (immediate fills at a configured price)
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Place the order described by `request.raw`.
    ///
    /// A MARKET order that is not fully filled is reported as `Status::Error`.
    /// On success the response carries the `Order`.
    async fn trade(&self, request: ExecRequest) -> ExecResponse;

    /// Look up an order previously placed for `request.cmd.id`.
    ///
    /// Must be idempotent: used by crash recovery when it is unknown whether
    /// the original trade reached the venue.
    async fn check(&self, request: ExecRequest) -> ExecResponse;

    /// Query account balances using the command's credentials.
    ///
    /// On success the response carries the balances and no `Order`.
    async fn info(&self, request: ExecRequest) -> ExecResponse;
}
