//! Error types for recovery orchestration
//!
//! Provides error handling for:
//! - Process launch failures
//! - Stage input preparation (option files, run directories)
//! - Batch submission conflicts
//! - Configuration loading

use rcy_archive::ArchiveError;
use std::path::PathBuf;

/// Main recovery error type
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Archive operation failed
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Stage preparation failed
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// Process could not be launched
    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    /// Several parts would export into one shared output file concurrently
    #[error(
        "concurrent recovery of {parts} FE parts into the shared output {output} is not possible; \
         set the maximum number of concurrent processes to 1 or turn off the export"
    )]
    SharedOutputConflict {
        /// Number of parts in the batch
        parts: usize,
        /// Shared output file
        output: PathBuf,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors while preparing a stage's input
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Writing an input or option file failed
    #[error("could not write {path}: {source}")]
    Write {
        /// File being written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The run directory could not be resolved
    #[error("run directory unavailable: {0}")]
    RunDirectory(#[from] ArchiveError),

    /// The FE part is not known to the model
    #[error("unknown FE part: {0}")]
    UnknownPart(String),
}

impl StageError {
    /// Wrap a write failure with the file it concerns
    #[inline]
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

/// Errors launching an external process
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The executable could not be spawned
    #[error("could not spawn process: {command_line}: {source}")]
    Spawn {
        /// Full command line attempted
        command_line: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The launcher refuses new processes
    #[error("launcher unavailable: {0}")]
    Unavailable(String),
}

impl LaunchError {
    /// Build a spawn error
    #[inline]
    pub fn spawn(command_line: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            command_line: command_line.into(),
            source,
        }
    }

    /// Check if launching again may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Spawn { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            Self::Unavailable(_) => true,
        }
    }
}

/// Errors loading configuration or model files
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("could not read {path}: {source}")]
    Read {
        /// File being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File content is not valid TOML for the expected type
    #[error("could not parse {path}: {source}")]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;
