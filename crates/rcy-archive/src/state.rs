//! Lifecycle of one scenario archive
//!
//! `Empty → Populating → Synced → (Saved | Incremented | Closed)`, and back to
//! `Populating` whenever a stage creates a run directory. A closed archive can
//! only be reopened.

use crate::error::ArchiveError;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a scenario archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    /// Nothing recorded yet
    Empty,
    /// Stages are creating run directories and writing output
    Populating,
    /// Reconciled with the files on disk
    Synced,
    /// Committed as the baseline
    Saved,
    /// Version counter bumped, new output goes to a fresh directory
    Incremented,
    /// Uncommitted output discarded, reverted to the baseline
    Closed,
}

impl ArchiveState {
    /// Check if results may be written in this state
    #[inline]
    #[must_use]
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Validate a state transition
///
/// # Errors
/// Returns [`ArchiveError::IllegalTransition`] if `to` is not reachable from
/// `from`.
pub fn validate_transition(from: ArchiveState, to: ArchiveState) -> Result<(), ArchiveError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(ArchiveError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: ArchiveState) -> Vec<ArchiveState> {
    use ArchiveState::{Closed, Empty, Incremented, Populating, Saved, Synced};
    match from {
        Empty | Populating | Synced | Saved | Incremented => {
            vec![Populating, Synced, Saved, Incremented, Closed]
        }
        Closed => vec![Empty, Populating, Synced, Closed],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = ArchiveState> {
        prop_oneof![
            Just(ArchiveState::Empty),
            Just(ArchiveState::Populating),
            Just(ArchiveState::Synced),
            Just(ArchiveState::Saved),
            Just(ArchiveState::Incremented),
            Just(ArchiveState::Closed),
        ]
    }

    #[test]
    fn closed_archive_cannot_be_saved() {
        assert!(validate_transition(ArchiveState::Closed, ArchiveState::Saved).is_err());
        assert!(validate_transition(ArchiveState::Closed, ArchiveState::Incremented).is_err());
        assert!(validate_transition(ArchiveState::Closed, ArchiveState::Synced).is_ok());
    }

    #[test]
    fn empty_is_only_reentered_from_closed() {
        assert!(validate_transition(ArchiveState::Saved, ArchiveState::Empty).is_err());
        assert!(validate_transition(ArchiveState::Closed, ArchiveState::Empty).is_ok());
    }

    #[test]
    fn close_is_idempotent() {
        assert!(validate_transition(ArchiveState::Closed, ArchiveState::Closed).is_ok());
    }

    proptest! {
        #[test]
        fn validation_matches_allowed_set(from in any_state(), to in any_state()) {
            let allowed = allowed_transitions(from);
            prop_assert_eq!(validate_transition(from, to).is_ok(), allowed.contains(&to));
        }
    }
}
