//! MSQ Domain Layer
//!
//! Pure domain model of the execution engine, with zero I/O dependencies.
//! Contains the Command entity and its outcomes (Order, Balance, history),
//! the command status state machine, the dictionaries that translate
//! reference ids to names, and the raw string projection handed to exchanges.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod dictionaries;
pub mod entities;
pub mod raw;
pub mod status;
pub mod value_objects;

// Re-export commonly used types
pub use dictionaries::{names, Dictionaries, Dictionary, DictId, INVALID_ID};
pub use entities::{
    AccountId, Balance, Command, CommandId, CommandRecord, ConnectorId, ExchangeId,
    HistoryEntry, NewCommand, Order,
};
pub use raw::RawCommand;
pub use status::{CommandStatus, StatusIds};
pub use value_objects::{optional_amount, optional_limit_price, DomainError, Instrument};
