//! HTTP API for the MSQ daemon.
//!
//! Provides REST endpoints for:
//! - Health check
//! - Command ingestion
//! - Command lookup (with Order and Balances once completed)
//! - Prometheus metrics

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use msq_domain::{
    names, optional_amount, optional_limit_price, AccountId, Balance, CommandId, CommandStatus,
    DictId, Dictionaries, Dictionary, Instrument, NewCommand, Order, RawCommand, StatusIds,
};
use msq_exec::PoolStats;
use msq_store::CommandStore;

use crate::metrics::EngineMetrics;

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState<S: CommandStore + ?Sized> {
    pub store: Arc<S>,
    pub dictionaries: Arc<Dictionaries>,
    pub statuses: StatusIds,
    /// Deadline window given to new commands
    pub execution_window: Duration,
    pub metrics: EngineMetrics,
    /// Dispatcher occupancy, when a dispatcher runs in this process
    pub pool_stats: Option<PoolStats>,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Request to create a command. Dictionary values are matched case-insensitively.
#[derive(Debug, Deserialize)]
pub struct CreateCommandRequest {
    pub exchange: String,
    #[serde(default)]
    pub instrument: String,
    pub direction: String,
    pub order_type: String,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub time_in_force: String,
    pub amount: Decimal,
    pub execution_type: String,
    #[serde(default)]
    pub ref_position_id: Option<String>,
    pub account_id: AccountId,
    pub api_key: String,
    pub secret_key: String,
    pub finger_print: String,
}

/// Response after creating a command.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCommandResponse {
    pub id: CommandId,
}

/// A command as seen by clients: credentials masked.
#[derive(Debug, Serialize)]
pub struct CommandView {
    #[serde(flatten)]
    pub command: RawCommand,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub balances: Vec<Balance>,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router<S>(state: Arc<ApiState<S>>) -> Router
where
    S: CommandStore + ?Sized + 'static,
{
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler::<S>))
        .route("/execution/v1/command", post(create_command_handler::<S>))
        .route("/execution/v1/command/:id", get(get_command_handler::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus metrics endpoint.
async fn metrics_handler<S>(State(state): State<Arc<ApiState<S>>>) -> Result<impl IntoResponse, ApiError>
where
    S: CommandStore + ?Sized + 'static,
{
    if let Some(stats) = &state.pool_stats {
        state.metrics.dispatcher_busy_workers.set(stats.busy() as i64);
    }

    let body = state.metrics.render().map_err(|e| {
        error!(error = %e, "Failed to render metrics");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Cannot render metrics: {}", e))
    })?;

    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// Create a command in CREATED.
///
/// Resubmitting the same `finger_print` returns the original id.
async fn create_command_handler<S>(
    State(state): State<Arc<ApiState<S>>>,
    payload: Result<Json<CreateCommandRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateCommandResponse>), ApiError>
where
    S: CommandStore + ?Sized + 'static,
{
    let Json(request) = payload.map_err(|e| {
        warn!(error = %e, "Malformed command request");
        api_error(StatusCode::BAD_REQUEST, e.body_text())
    })?;

    let command = validate_command(request, &state.dictionaries, Utc::now(), state.execution_window)
        .map_err(|message| {
            warn!(%message, "Rejected command request");
            api_error(StatusCode::BAD_REQUEST, message)
        })?;

    let fingerprint = command.fingerprint.clone();
    let id = state.store.insert_command(command).await.map_err(|e| {
        error!(error = %e, "Cannot insert command");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Cannot insert command: {}", e))
    })?;

    info!(execution_id = id, %fingerprint, "Command accepted");
    Ok((StatusCode::CREATED, Json(CreateCommandResponse { id })))
}

/// Get a single command.
async fn get_command_handler<S>(
    State(state): State<Arc<ApiState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CommandView>, ApiError>
where
    S: CommandStore + ?Sized + 'static,
{
    let id: CommandId = id.trim().parse().map_err(|_| {
        api_error(StatusCode::BAD_REQUEST, format!("Wrong command 'id' [{}]", id))
    })?;

    let record = state
        .store
        .load_by_id(id)
        .await
        .map_err(|e| {
            error!(execution_id = id, error = %e, "Cannot load command");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Cannot load command [{}]", id))
        })?
        .ok_or_else(|| {
            api_error(StatusCode::NOT_FOUND, format!("Not found command with id [{}]", id))
        })?;

    let completed = state.statuses.status(record.command.status_id) == Some(CommandStatus::Completed);
    let command = RawCommand::project(&record.command, &state.dictionaries).redacted();

    Ok(Json(if completed {
        CommandView {
            command,
            order: record.order,
            balances: record.balances,
        }
    } else {
        CommandView {
            command,
            order: None,
            balances: Vec::new(),
        }
    }))
}

// =============================================================================
// Validation
// =============================================================================

/// Turn a request into a command with deadline `now + window`.
///
/// # Errors
/// A client-facing message naming the first invalid parameter.
pub fn validate_command(
    request: CreateCommandRequest,
    dictionaries: &Dictionaries,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<NewCommand, String> {
    let exchange_id = lookup(dictionaries.exchanges(), "exchange", &request.exchange)?;
    let direction_id = lookup(dictionaries.directions(), "direction", &request.direction)?;
    let order_type_id = lookup(dictionaries.order_types(), "order_type", &request.order_type)?;

    let is_info = order_type_id == dictionaries.order_types().id_by_name(names::order_type::INFO);
    let instrument = match Instrument::parse(&request.instrument) {
        Ok(instrument) => instrument.into_inner(),
        Err(_) if is_info && request.instrument.trim().is_empty() => String::new(),
        Err(_) => return Err(wrong("instrument", &request.instrument)),
    };

    let is_limit = order_type_id == dictionaries.order_types().id_by_name(names::order_type::LIMIT);
    let limit_price = if is_limit {
        match request.limit_price {
            Some(price) if price > Decimal::ZERO => Some(price),
            other => {
                let shown = other.map(|p| p.to_string()).unwrap_or_default();
                return Err(wrong("limit_price", &shown));
            },
        }
    } else {
        request.limit_price.and_then(optional_limit_price)
    };

    let time_in_force_id =
        lookup(dictionaries.time_in_force(), "time_in_force", &request.time_in_force)?;

    if request.amount < Decimal::ZERO {
        return Err(wrong("amount", &request.amount.to_string()));
    }
    let amount = optional_amount(request.amount);

    let execution_type_id =
        lookup(dictionaries.execution_types(), "execution_type", &request.execution_type)?;

    for (name, value) in [
        ("api_key", &request.api_key),
        ("secret_key", &request.secret_key),
        ("finger_print", &request.finger_print),
    ] {
        if value.is_empty() {
            return Err(wrong(name, value));
        }
    }

    let window = chrono::Duration::from_std(window)
        .map_err(|_| "Execution window out of range".to_string())?;

    Ok(NewCommand {
        exchange_id,
        instrument_name: instrument,
        direction_id,
        order_type_id,
        limit_price,
        amount,
        execution_type_id,
        execute_till: now + window,
        ref_position_id: request.ref_position_id.filter(|r| !r.is_empty()),
        time_in_force_id,
        account_id: request.account_id,
        api_key: request.api_key,
        secret_key: request.secret_key,
        fingerprint: request.finger_print,
    })
}

fn lookup(dictionary: &Dictionary, parameter: &str, value: &str) -> Result<DictId, String> {
    let name = value.trim().to_uppercase();
    match dictionary.id_by_name(&name) {
        id if id < 0 => Err(wrong(parameter, &name)),
        id => Ok(id),
    }
}

fn wrong(parameter: &str, value: &str) -> String {
    format!("Wrong '{}' parameter [{}]", parameter, value)
}

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

// =============================================================================
// Tests
// =============================================================================
