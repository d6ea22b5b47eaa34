//! Command status state machine.
//!
//! ```text
//! CREATED ──► EXECUTING ──► COMPLETED | ERROR | TIMED_OUT | REJECTED
//!    │
//!    └──────► TIMED_OUT
//! ```
//!
//! Statuses are persisted as dictionary ids; [`StatusIds`] resolves the
//! mapping once from the loaded dictionaries.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dictionaries::{names, DictId, Dictionaries};
use crate::value_objects::DomainError;

/// Lifecycle status of a Command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Accepted by ingestion, not yet claimed
    Created,
    /// Claimed by a connector and handed to the dispatcher
    Executing,
    /// Executed (or checked) successfully
    Completed,
    /// Execution failed
    Error,
    /// Deadline passed before or during execution
    TimedOut,
    /// Refused by the exchange
    Rejected,
}

impl CommandStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [CommandStatus; 6] = [
        CommandStatus::Created,
        CommandStatus::Executing,
        CommandStatus::Completed,
        CommandStatus::Error,
        CommandStatus::TimedOut,
        CommandStatus::Rejected,
    ];

    /// Dictionary name for this status
    pub fn name(&self) -> &'static str {
        match self {
            CommandStatus::Created => names::status::CREATED,
            CommandStatus::Executing => names::status::EXECUTING,
            CommandStatus::Completed => names::status::COMPLETED,
            CommandStatus::Error => names::status::ERROR,
            CommandStatus::TimedOut => names::status::TIMED_OUT,
            CommandStatus::Rejected => names::status::REJECTED,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Created | CommandStatus::Executing)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        match (self, next) {
            (Created, Executing) | (Created, TimedOut) => true,
            (Executing, Completed | Error | TimedOut | Rejected) => true,
            _ => false,
        }
    }

    /// Validate `self → next`.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` for illegal transitions
    pub fn transition_to(&self, next: CommandStatus) -> Result<CommandStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidStateTransition(format!("{} -> {}", self, next)))
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// StatusIds
// =============================================================================

/// Dictionary ids of every [`CommandStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusIds {
    ids: [DictId; 6],
}

impl StatusIds {
    /// Resolve every status from the execution status dictionary.
    ///
    /// # Errors
    /// Returns `DomainError::MissingEntry` if any status name is absent
    pub fn resolve(dictionaries: &Dictionaries) -> Result<Self, DomainError> {
        let statuses = dictionaries.execution_statuses();
        let mut ids = [0; 6];
        for (slot, status) in ids.iter_mut().zip(CommandStatus::ALL) {
            *slot = statuses.require(status.name())?;
        }
        Ok(Self { ids })
    }

    /// Ids of [`Dictionaries::builtin`]
    pub fn builtin() -> Self {
        Self { ids: [1, 2, 3, 4, 5, 6] }
    }

    /// Dictionary id of a status
    pub fn id(&self, status: CommandStatus) -> DictId {
        self.ids[Self::index(status)]
    }

    /// Status for a dictionary id, if it is one of ours
    pub fn status(&self, id: DictId) -> Option<CommandStatus> {
        CommandStatus::ALL.into_iter().find(|s| self.id(*s) == id)
    }

    fn index(status: CommandStatus) -> usize {
        match status {
            CommandStatus::Created => 0,
            CommandStatus::Executing => 1,
            CommandStatus::Completed => 2,
            CommandStatus::Error => 3,
            CommandStatus::TimedOut => 4,
            CommandStatus::Rejected => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionaries::Dictionary;

    #[test]
    fn test_forward_transitions() {
        use CommandStatus::*;
        assert!(Created.can_transition_to(Executing));
        assert!(Created.can_transition_to(TimedOut));
        for terminal in [Completed, Error, TimedOut, Rejected] {
            assert!(Executing.can_transition_to(terminal));
            assert!(terminal.is_terminal());
        }
    }

    #[test]
    fn test_no_backward_or_skipping_transitions() {
        use CommandStatus::*;
        assert!(!Created.can_transition_to(Completed));
        assert!(!Created.can_transition_to(Error));
        assert!(!Executing.can_transition_to(Created));
        assert!(!Completed.can_transition_to(Executing));
        assert!(!TimedOut.can_transition_to(TimedOut));

        let err = Completed.transition_to(Error).unwrap_err();
        assert_eq!(err, DomainError::InvalidStateTransition("COMPLETED -> ERROR".to_string()));
    }

    #[test]
    fn test_status_ids_round_trip_builtin() {
        let ids = StatusIds::resolve(&Dictionaries::builtin()).unwrap();
        assert_eq!(ids, StatusIds::builtin());
        assert_eq!(ids.id(CommandStatus::Created), 1);
        assert_eq!(ids.status(5), Some(CommandStatus::TimedOut));
        assert_eq!(ids.status(99), None);
    }

    #[test]
    fn test_status_ids_missing_status() {
        let builtin = Dictionaries::builtin();
        let statuses = Dictionary::from_rows(
            "execution_status",
            vec![(1, "CREATED".to_string()), (2, "EXECUTING".to_string())],
        )
        .unwrap();
        let dicts = Dictionaries::new(
            builtin.exchanges().clone(),
            builtin.directions().clone(),
            builtin.order_types().clone(),
            builtin.time_in_force().clone(),
            builtin.execution_types().clone(),
            statuses,
        )
        .unwrap();

        assert!(matches!(StatusIds::resolve(&dicts), Err(DomainError::MissingEntry { .. })));
    }
}
