//! Stub exchange for development and tests.
//!
//! Simulates immediate fills at a configured price without any network I/O,
//! and records every call so tests can assert which capability was used.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;

use msq_domain::{Balance, CommandId, Order};

use crate::ports::ExchangePort;
use crate::proto::{ExecRequest, ExecResponse, ExecType};

/// How the stub answers `trade` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubOutcome {
    /// Fill every order
    Fill,
    /// Answer with `Status::Error` and this description
    Fail(String),
    /// Answer with `Status::Rejected` and this description
    Reject(String),
}

// =============================================================================
// Stub Exchange
// =============================================================================

/// Stub exchange.
pub struct StubExchange {
    fill_price: Decimal,
    /// Commission rate (0.001 = 0.1%)
    commission_rate: Decimal,
    commission_asset: String,
    latency: Duration,
    outcome: RwLock<StubOutcome>,
    fail_next: RwLock<bool>,
    balances: RwLock<Vec<Balance>>,
    placed: RwLock<HashMap<CommandId, Order>>,
    calls: RwLock<Vec<(ExecType, CommandId)>>,
    order_counter: AtomicI64,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl StubExchange {
    /// Create a stub that fills at `fill_price`.
    pub fn new(fill_price: Decimal) -> Self {
        Self {
            fill_price,
            commission_rate: Decimal::new(1, 3),
            commission_asset: "BNB".to_string(),
            latency: Duration::ZERO,
            outcome: RwLock::new(StubOutcome::Fill),
            fail_next: RwLock::new(false),
            balances: RwLock::new(Vec::new()),
            placed: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            order_counter: AtomicI64::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Set how subsequent trades are answered.
    pub fn set_outcome(&self, outcome: StubOutcome) {
        *write(&self.outcome) = outcome;
    }

    /// Configure the next trade to fail.
    pub fn set_fail_next(&self, fail: bool) {
        *write(&self.fail_next) = fail;
    }

    /// Balances reported by `info`.
    pub fn set_balances(&self, balances: Vec<Balance>) {
        *write(&self.balances) = balances;
    }

    /// Pretend an order was placed earlier (e.g. before a crash).
    pub fn remember_order(&self, order: Order) {
        write(&self.placed).insert(order.execution_id, order);
    }

    /// Order placed for a command, if any
    pub fn placed_order(&self, id: CommandId) -> Option<Order> {
        read(&self.placed).get(&id).cloned()
    }

    /// Every call made so far, in arrival order
    pub fn calls(&self) -> Vec<(ExecType, CommandId)> {
        read(&self.calls).clone()
    }

    /// Number of calls of one kind
    pub fn call_count(&self, what: ExecType) -> usize {
        read(&self.calls).iter().filter(|(w, _)| *w == what).count()
    }

    /// Highest number of calls observed in progress at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn enter(&self, what: ExecType, id: CommandId) -> Instant {
        write(&self.calls).push((what, id));
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let started = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        started
    }

    fn leave(&self, response: ExecResponse, started: Instant) -> ExecResponse {
        self.active.fetch_sub(1, Ordering::SeqCst);
        response.with_latency(started.elapsed())
    }

    fn take_fail_next(&self) -> bool {
        std::mem::take(&mut *write(&self.fail_next))
    }

    fn fill(&self, request: &ExecRequest) -> Order {
        let price = request.cmd.limit_price.unwrap_or(self.fill_price);
        let amount = request.cmd.amount.unwrap_or(Decimal::ZERO);
        Order {
            external_order_id: self.order_counter.fetch_add(1, Ordering::SeqCst) + 1,
            execution_id: request.cmd.id,
            price,
            commission: price * amount * self.commission_rate,
            commission_asset: self.commission_asset.clone(),
        }
    }
}

#[async_trait]
impl ExchangePort for StubExchange {
    async fn trade(&self, request: ExecRequest) -> ExecResponse {
        let started = self.enter(ExecType::Execute, request.cmd.id).await;

        let response = if self.take_fail_next() {
            ExecResponse::error(request, "Simulated exchange failure")
        } else {
            let outcome = read(&self.outcome).clone();
            match outcome {
                StubOutcome::Fail(description) => ExecResponse::error(request, description),
                StubOutcome::Reject(description) => ExecResponse::rejected(request, description),
                StubOutcome::Fill => {
                    let order = self.fill(&request);
                    write(&self.placed).insert(order.execution_id, order.clone());
                    ExecResponse::ok(request).with_order(order)
                },
            }
        };

        self.leave(response, started)
    }

    async fn check(&self, request: ExecRequest) -> ExecResponse {
        let started = self.enter(ExecType::Check, request.cmd.id).await;

        let response = match self.placed_order(request.cmd.id) {
            Some(order) => ExecResponse::ok(request).with_order(order),
            None => {
                let description = format!("no order found for execution {}", request.cmd.id);
                ExecResponse::error(request, description)
            },
        };

        self.leave(response, started)
    }

    async fn info(&self, request: ExecRequest) -> ExecResponse {
        let started = self.enter(ExecType::Info, request.cmd.id).await;
        let balances = read(&self.balances).clone();
        self.leave(ExecResponse::ok(request).with_balances(balances), started)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Status;
    use chrono::{Duration as ChronoDuration, Utc};
    use msq_domain::{Command, Dictionaries};
    use rust_decimal_macros::dec;

    fn request(what: ExecType, id: CommandId) -> ExecRequest {
        let now = Utc::now();
        let cmd = Command {
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
        };
        ExecRequest::new(what, cmd, &Dictionaries::builtin())
    }

    #[tokio::test]
    async fn test_trade_fills_at_configured_price() {
        let exchange = StubExchange::new(dec!(250));

        let response = exchange.trade(request(ExecType::Execute, 1)).await;

        assert_eq!(response.status, Status::Ok);
        let order = response.order.unwrap();
        assert_eq!(order.execution_id, 1);
        assert_eq!(order.price, dec!(250));
        assert_eq!(order.commission, dec!(2.5));
        assert_eq!(order.external_order_id, 1);
    }

    #[tokio::test]
    async fn test_fail_next_resets() {
        let exchange = StubExchange::new(dec!(250));
        exchange.set_fail_next(true);

        let failed = exchange.trade(request(ExecType::Execute, 1)).await;
        let filled = exchange.trade(request(ExecType::Execute, 2)).await;

        assert_eq!(failed.status, Status::Error);
        assert!(failed.order.is_none());
        assert_eq!(filled.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_reject_outcome() {
        let exchange = StubExchange::new(dec!(250));
        exchange.set_outcome(StubOutcome::Reject("insufficient balance".to_string()));

        let response = exchange.trade(request(ExecType::Execute, 3)).await;

        assert_eq!(response.status, Status::Rejected);
        assert_eq!(response.description, "insufficient balance");
        assert!(exchange.placed_order(3).is_none());
    }

    #[tokio::test]
    async fn test_check_is_idempotent() {
        let exchange = StubExchange::new(dec!(250));
        exchange.trade(request(ExecType::Execute, 4)).await;

        let first = exchange.check(request(ExecType::Check, 4)).await;
        let second = exchange.check(request(ExecType::Check, 4)).await;

        assert_eq!(first.status, Status::Ok);
        assert_eq!(first.order, second.order);
        assert_eq!(exchange.call_count(ExecType::Check), 2);
    }

    #[tokio::test]
    async fn test_info_returns_balances() {
        let exchange = StubExchange::new(dec!(250));
        exchange.set_balances(vec![Balance {
            asset: "USDT".to_string(),
            free: dec!(1000),
            locked: dec!(5),
        }]);

        let response = exchange.info(request(ExecType::Info, 5)).await;

        assert_eq!(response.status, Status::Ok);
        assert!(response.order.is_none());
        assert_eq!(response.balances.unwrap()[0].asset, "USDT");
        assert_eq!(exchange.calls(), vec![(ExecType::Info, 5)]);
    }
}
