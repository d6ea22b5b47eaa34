//! MSQ Storage Layer
//!
//! The durable command queue: claims, transitions, history and outcomes of
//! Commands.
//!
//! # Architecture
//!
//! - **Repository trait**: `CommandStore`, the storage port
//! - **In-memory store**: fast implementation for tests and development
//! - **PostgreSQL store**: production implementation (feature `postgres`)
//!
//! # Usage
//!
//! ```rust
//! use msq_store::{CommandStore, MemoryStore};
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!
//!     // Nothing to claim in an empty store
//!     let claimed = store.claim_for_execution(1, 1, Utc::now(), 1).await.unwrap();
//!     assert!(claimed.is_empty());
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{
    begin, connect, finish_tx, insert_command_tx, load_dictionaries, PgCommandStore, PoolSettings,
};
pub use repository::{CommandStore, Finish, EXPIRED_DESCRIPTION};
