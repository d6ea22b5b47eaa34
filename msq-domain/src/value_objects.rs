//! Value Objects for the MSQ Domain
//!
//! Validated domain primitives and the input conventions for optional
//! monetary fields.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain errors for value object and dictionary validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Instrument name is empty, too long or not upper case
    #[error("Invalid instrument: {0}")]
    InvalidInstrument(String),

    /// A dictionary has no entries
    #[error("Dictionary '{0}' is empty")]
    EmptyDictionary(String),

    /// A required dictionary entry is missing
    #[error("Dictionary '{dictionary}' has no entry named '{name}'")]
    MissingEntry {
        /// Dictionary that was searched
        dictionary: String,
        /// Name that was not found
        name: String,
    },

    /// A dictionary lists the same id or name twice
    #[error("Dictionary '{dictionary}' has a duplicate entry: {entry}")]
    DuplicateEntry {
        /// Dictionary being built
        dictionary: String,
        /// Offending id or name
        entry: String,
    },

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

// =============================================================================
// Instrument
// =============================================================================

/// Maximum instrument name length accepted at ingestion.
pub const MAX_INSTRUMENT_LEN: usize = 20;

/// Exchange instrument name (e.g. "BTCUSDT").
///
/// # Invariants
/// - 1..=20 characters
/// - upper case, no surrounding whitespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument(String);

impl Instrument {
    /// Create an instrument from user input.
    ///
    /// Input is trimmed and upper-cased before validation.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidInstrument` if the name is empty or too long
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let name = input.trim().to_uppercase();
        if name.is_empty() {
            return Err(DomainError::InvalidInstrument("instrument must not be empty".to_string()));
        }
        if name.chars().count() > MAX_INSTRUMENT_LEN {
            return Err(DomainError::InvalidInstrument(format!(
                "instrument '{}' is longer than {} characters",
                name, MAX_INSTRUMENT_LEN
            )));
        }
        Ok(Self(name))
    }

    /// Get the instrument name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner name
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Optional monetary inputs
// =============================================================================

/// Interpret a limit price received from an upstream producer.
///
/// A negative value means "no limit price".
pub fn optional_limit_price(value: Decimal) -> Option<Decimal> {
    if value < Decimal::ZERO {
        None
    } else {
        Some(value)
    }
}

/// Interpret an amount received from an upstream producer.
///
/// A non-positive value means "no amount" (e.g. balance queries).
pub fn optional_amount(value: Decimal) -> Option<Decimal> {
    if value <= Decimal::ZERO {
        None
    } else {
        Some(value)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_instrument_normalizes_case() {
        let instrument = Instrument::parse(" btcusdt ").unwrap();
        assert_eq!(instrument.as_str(), "BTCUSDT");
        assert_eq!(instrument.to_string(), "BTCUSDT");
    }

    #[test]
    fn test_instrument_rejects_empty_and_long_names() {
        assert!(matches!(Instrument::parse("   "), Err(DomainError::InvalidInstrument(_))));
        assert!(Instrument::parse(&"A".repeat(20)).is_ok());
        assert!(Instrument::parse(&"A".repeat(21)).is_err());
    }

    #[test]
    fn test_optional_limit_price() {
        assert_eq!(optional_limit_price(dec!(-1)), None);
        assert_eq!(optional_limit_price(dec!(0)), Some(dec!(0)));
        assert_eq!(optional_limit_price(dec!(101.5)), Some(dec!(101.5)));
    }

    #[test]
    fn test_optional_amount() {
        assert_eq!(optional_amount(dec!(0)), None);
        assert_eq!(optional_amount(dec!(-3)), None);
        assert_eq!(optional_amount(dec!(10)), Some(dec!(10)));
    }
}
