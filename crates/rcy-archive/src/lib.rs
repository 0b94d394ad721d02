//! Result archives for recovery runs
//!
//! Keeps track of which solver result files belong to which scenario:
//! - Versioned sub-task trees mirroring `<name>_<version>` directories
//! - Increment numbering of result files, recovered from listings
//! - Per-scenario save, save-as, increment, close and activation
//! - A committed version record per scenario, so unsaved work stays unsaved
//! - Read-side extractors that follow the active scenario
//!
//! # Example
//!
//! ```rust,ignore
//! use rcy_archive::{ArchiveConfig, LocalFileSystem, ResultArchiveManager, ScenarioId};
//! use std::sync::Arc;
//!
//! let config = ArchiveConfig::default().with_rdb_root("model_RDB");
//! let archives = ResultArchiveManager::new(config, Arc::new(LocalFileSystem));
//! archives.open(ScenarioId::Master)?;
//! archives.save(true)?;
//! ```

pub mod archive;
pub mod error;
pub mod extractor;
pub mod fs;
pub mod increment;
pub mod manager;
pub mod manifest;
pub mod path;
pub mod scenario;
pub mod state;

pub use archive::{ResultArchive, SubTask, SyncReport, DEFAULT_TASK_NAME};
pub use error::{ArchiveError, PathError, Result};
pub use extractor::{
    ExtractorEvent, ExtractorKind, ResultExtractor, ResultExtractorManager, ResultsFlag,
};
pub use fs::{FileSystem, LocalFileSystem};
pub use increment::{latest, next_increment, numbered_file_name};
pub use manager::{ArchiveConfig, ArchiveEvent, ResultArchiveManager, WeightedFiles};
pub use manifest::{CommittedManifest, MANIFEST_FILE};
pub use path::TaskPath;
pub use scenario::{Scenario, ScenarioId};
pub use state::ArchiveState;
