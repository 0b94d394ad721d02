//! Error types for result archives
//!
//! Covers:
//! - Filesystem failures while syncing, saving or closing an archive
//! - Malformed sub-task paths and directory names
//! - Unreadable committed version records
//! - Unknown or duplicate scenarios
//! - Illegal archive state transitions

use crate::scenario::ScenarioId;
use crate::state::ArchiveState;
use std::path::PathBuf;

/// Main archive error type
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Filesystem operation failed
    #[error("i/o error on {path}: {source}")]
    Io {
        /// Path the operation was applied to
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Committed version record is unreadable
    #[error("invalid committed record {path}: {source}")]
    Manifest {
        /// Record file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// Sub-task path is malformed
    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    /// Scenario is not registered with the manager
    #[error("unknown scenario: {0}")]
    UnknownScenario(ScenarioId),

    /// Scenario is already registered
    #[error("scenario already exists: {0}")]
    DuplicateScenario(ScenarioId),

    /// The master scenario cannot be removed
    #[error("the master scenario cannot be removed")]
    MasterNotRemovable,

    /// Archive state transition is not allowed
    #[error("illegal archive transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// Current state
        from: ArchiveState,
        /// Requested state
        to: ArchiveState,
    },
}

impl ArchiveError {
    /// Wrap an i/o error with the path it concerns
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Check if the operation may succeed when retried
    ///
    /// Only transient filesystem errors qualify.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Sub-task path errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Empty segment in a path
    #[error("empty segment in path '{0}'")]
    EmptySegment(String),

    /// Segment that would escape the archive directory
    #[error("segment '{0}' is not allowed")]
    ReservedSegment(String),

    /// Segment contains a path separator
    #[error("segment '{0}' contains a path separator")]
    Separator(String),
}

/// Result type for archive operations
pub type Result<T> = std::result::Result<T, ArchiveError>;
