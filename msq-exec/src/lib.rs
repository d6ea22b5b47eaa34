//! MSQ Execution Layer
//!
//! Message protocol and bounded dispatch fabric between the command store and
//! an exchange capability provider.
//!
//! # Architecture
//!
//! ```text
//! Coordinator ─► ExecRequest ─► Dispatcher ─► ExchangePort ─► ExecResponse ─► Coordinator
//!                               (N workers, round-robin, deadline check)
//! ```
//!
//! # Components
//!
//! - **Protocol**: `ExecType`, `Status`, `ExecRequest`, `ExecResponse`
//! - **Ports**: `ExchangePort` (`trade`, `check`, `info`)
//! - **Ring**: round-robin handoff to idle workers
//! - **Dispatcher**: bounded worker pool with drain on shutdown
//! - **Stub**: in-process exchange for development and tests

#![warn(clippy::all)]

pub mod dispatcher;
pub mod error;
pub mod ports;
pub mod proto;
pub mod ring;
pub mod stub;

// Re-exports for convenience
pub use dispatcher::{
    execute, validate_pool_size, Dispatcher, DispatcherConfig, DispatcherHandle, PoolStats,
    DEADLINE_PASSED, MAX_POOL_SIZE,
};
pub use error::{ExecError, ExecResult};
pub use ports::ExchangePort;
pub use proto::{ExecRequest, ExecResponse, ExecType, Status};
pub use ring::{Handoff, RoundRobin, WorkerQueue, WorkerRing};
pub use stub::{StubExchange, StubOutcome};
