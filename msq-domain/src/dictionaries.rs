//! Reference dictionaries.
//!
//! Six immutable bidirectional id↔name tables loaded once at startup and
//! shared read-only across every task:
//!
//! | Table | Example names |
//! |-------|---------------|
//! | exchanges | BINANCE, IB |
//! | directions | BUY, SELL, ACCOUNT |
//! | order types | MARKET, LIMIT, INFO |
//! | time in force | GTC, IOC, FOK |
//! | execution types | OPEN, CLOSE, REQUEST |
//! | execution statuses | CREATED, EXECUTING, COMPLETED, ERROR, TIMED_OUT, REJECTED |
//!
//! Lookups of unknown keys return [`INVALID_ID`] or an empty name; callers
//! must check the result.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value_objects::DomainError;

/// Dictionary row identifier (SMALLINT in the store).
pub type DictId = i16;

/// Sentinel returned for names that are not in a dictionary.
pub const INVALID_ID: DictId = -1;

/// Well-known dictionary names.
pub mod names {
    /// Exchange names
    pub mod exchange {
        /// Binance spot
        pub const BINANCE: &str = "BINANCE";
        /// Interactive Brokers
        pub const IB: &str = "IB";
    }

    /// Direction names
    pub mod direction {
        /// Buy
        pub const BUY: &str = "BUY";
        /// Sell
        pub const SELL: &str = "SELL";
        /// Account query (no trade)
        pub const ACCOUNT: &str = "ACCOUNT";
    }

    /// Order type names
    pub mod order_type {
        /// Market order
        pub const MARKET: &str = "MARKET";
        /// Limit order
        pub const LIMIT: &str = "LIMIT";
        /// Balance query
        pub const INFO: &str = "INFO";
    }

    /// Time in force names
    pub mod time_in_force {
        /// Good till cancelled
        pub const GTC: &str = "GTC";
        /// Immediate or cancel
        pub const IOC: &str = "IOC";
        /// Fill or kill
        pub const FOK: &str = "FOK";
    }

    /// Execution type names
    pub mod execution_type {
        /// Open a position
        pub const OPEN: &str = "OPEN";
        /// Close a position
        pub const CLOSE: &str = "CLOSE";
        /// Account request
        pub const REQUEST: &str = "REQUEST";
    }

    /// Execution status names
    pub mod status {
        /// Accepted, waiting to be claimed
        pub const CREATED: &str = "CREATED";
        /// Claimed by a connector
        pub const EXECUTING: &str = "EXECUTING";
        /// Executed successfully
        pub const COMPLETED: &str = "COMPLETED";
        /// Execution failed
        pub const ERROR: &str = "ERROR";
        /// Deadline passed
        pub const TIMED_OUT: &str = "TIMED_OUT";
        /// Refused by the exchange
        pub const REJECTED: &str = "REJECTED";
    }
}

// =============================================================================
// Dictionary
// =============================================================================

/// Immutable bidirectional id↔name map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dictionary {
    name: String,
    by_id: HashMap<DictId, String>,
    by_name: HashMap<String, DictId>,
}

impl Dictionary {
    /// Build a dictionary from `(id, name)` rows.
    ///
    /// # Errors
    /// Returns `DomainError::DuplicateEntry` if an id or name appears twice
    pub fn from_rows(
        name: impl Into<String>,
        rows: impl IntoIterator<Item = (DictId, String)>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();

        for (id, value) in rows {
            if by_id.contains_key(&id) {
                return Err(DomainError::DuplicateEntry {
                    dictionary: name,
                    entry: id.to_string(),
                });
            }
            if by_name.contains_key(&value) {
                return Err(DomainError::DuplicateEntry { dictionary: name, entry: value });
            }
            by_id.insert(id, value.clone());
            by_name.insert(value, id);
        }

        Ok(Self { name, by_id, by_name })
    }

    /// Dictionary name (e.g. "order_type")
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name for an id, or `""` when the id is unknown.
    pub fn name_by_id(&self, id: DictId) -> &str {
        self.by_id.get(&id).map(String::as_str).unwrap_or("")
    }

    /// Id for a name, or [`INVALID_ID`] when the name is unknown.
    pub fn id_by_name(&self, name: &str) -> DictId {
        self.by_name.get(name).copied().unwrap_or(INVALID_ID)
    }

    /// Id for a name that must exist.
    ///
    /// # Errors
    /// Returns `DomainError::MissingEntry` when the name is unknown
    pub fn require(&self, name: &str) -> Result<DictId, DomainError> {
        self.by_name.get(name).copied().ok_or_else(|| DomainError::MissingEntry {
            dictionary: self.name.clone(),
            name: name.to_string(),
        })
    }

    /// Whether the id is present
    pub fn contains_id(&self, id: DictId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the dictionary has no entries
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// =============================================================================
// Dictionaries
// =============================================================================

/// The six reference dictionaries, validated as a set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dictionaries {
    exchanges: Dictionary,
    directions: Dictionary,
    order_types: Dictionary,
    time_in_force: Dictionary,
    execution_types: Dictionary,
    execution_statuses: Dictionary,
}

impl Dictionaries {
    /// Assemble the dictionary set.
    ///
    /// # Errors
    /// Returns `DomainError::EmptyDictionary` if any table has no rows
    pub fn new(
        exchanges: Dictionary,
        directions: Dictionary,
        order_types: Dictionary,
        time_in_force: Dictionary,
        execution_types: Dictionary,
        execution_statuses: Dictionary,
    ) -> Result<Self, DomainError> {
        for dictionary in [
            &exchanges,
            &directions,
            &order_types,
            &time_in_force,
            &execution_types,
            &execution_statuses,
        ] {
            if dictionary.is_empty() {
                return Err(DomainError::EmptyDictionary(dictionary.name().to_string()));
            }
        }

        Ok(Self {
            exchanges,
            directions,
            order_types,
            time_in_force,
            execution_types,
            execution_statuses,
        })
    }

    /// The reference rows seeded by the schema migrations.
    ///
    /// Used by the in-memory store and tests; production processes load the
    /// rows from the database instead.
    pub fn builtin() -> Self {
        fn table(name: &str, rows: &[(DictId, &str)]) -> Dictionary {
            let mut by_id = HashMap::new();
            let mut by_name = HashMap::new();
            for (id, value) in rows {
                by_id.insert(*id, (*value).to_string());
                by_name.insert((*value).to_string(), *id);
            }
            Dictionary { name: name.to_string(), by_id, by_name }
        }

        use names::*;
        Self {
            exchanges: table("exchange", &[(1, exchange::BINANCE), (2, exchange::IB)]),
            directions: table(
                "direction",
                &[(1, direction::BUY), (2, direction::SELL), (3, direction::ACCOUNT)],
            ),
            order_types: table(
                "order_type",
                &[(1, order_type::MARKET), (2, order_type::LIMIT), (3, order_type::INFO)],
            ),
            time_in_force: table(
                "time_in_force",
                &[(1, time_in_force::GTC), (2, time_in_force::IOC), (3, time_in_force::FOK)],
            ),
            execution_types: table(
                "execution_type",
                &[
                    (1, execution_type::OPEN),
                    (2, execution_type::CLOSE),
                    (3, execution_type::REQUEST),
                ],
            ),
            execution_statuses: table(
                "execution_status",
                &[
                    (1, status::CREATED),
                    (2, status::EXECUTING),
                    (3, status::COMPLETED),
                    (4, status::ERROR),
                    (5, status::TIMED_OUT),
                    (6, status::REJECTED),
                ],
            ),
        }
    }

    /// Exchanges
    pub fn exchanges(&self) -> &Dictionary {
        &self.exchanges
    }

    /// Directions
    pub fn directions(&self) -> &Dictionary {
        &self.directions
    }

    /// Order types
    pub fn order_types(&self) -> &Dictionary {
        &self.order_types
    }

    /// Time in force values
    pub fn time_in_force(&self) -> &Dictionary {
        &self.time_in_force
    }

    /// Execution types
    pub fn execution_types(&self) -> &Dictionary {
        &self.execution_types
    }

    /// Execution statuses
    pub fn execution_statuses(&self) -> &Dictionary {
        &self.execution_statuses
    }
}

// =============================================================================
// Tests
// =============================================================================
