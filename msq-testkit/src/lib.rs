//! Test helpers for MSQ execution engine tests.
//!
//! Provides command fixtures for in-memory tests and seeding helpers for
//! database-backed tests.

mod fixtures;
mod helpers;

pub use fixtures::CommandFixture;
pub use helpers::{backdate_update, seed_command, status_name};

pub type Result<T> = anyhow::Result<T>;
