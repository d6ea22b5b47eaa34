//! MSQ Daemon Library
//!
//! Runtime orchestrator for the MSQ command execution engine.
//!
//! # Architecture
//!
//! ```text
//! API → Store ← Timeouter
//!         ↓ claim
//!    Coordinator ──ExecRequest──► Dispatcher ──► Exchange
//!         ↑                           │
//!         └────────ExecResponse───────┘
//!         ↓
//!      Dumper → Store, Notification sink
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **Coordinator**: Claims work, crash recovery, admission control
//! - **Dumper**: Persists outcomes
//! - **Timeouter**: Expires commands that were never started
//! - **API**: HTTP ingestion and lookup endpoints
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use msqd::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::new_stub(config).expect("Failed to build daemon");
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod admission;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod dumper;
pub mod error;
pub mod metrics;
pub mod timeouter;

#[cfg(feature = "postgres")]
pub mod db;

// Re-exports for convenience
pub use admission::AdmissionCounter;
pub use config::{ApiConfig, Config, ConnectorConfig, Environment, TimeouterConfig};
pub use coordinator::{Coordinator, CoordinatorChannels, CoordinatorConfig};
pub use daemon::{Daemon, StoreSet};
pub use dumper::{finish_for, Dumper, DumperConfig, DumperHandle};
pub use error::{DaemonError, DaemonResult};
pub use metrics::EngineMetrics;
pub use timeouter::Timeouter;
