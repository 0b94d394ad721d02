//! Recovery orchestration
//!
//! Runs the FEDEM dynamics solver and its recovery solvers as external
//! processes:
//! - One [`RecoveryStage`] per solver kind, deciding readiness from the
//!   scenario's result archive
//! - Option file generation with paths relative to each run directory
//! - A [`ProcessGroupManager`] bounding concurrency and supervising exits
//! - Per-scenario cancellation that leaves other scenarios running
//!
//! # Example
//!
//! ```rust,ignore
//! use rcy_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RecoveryConfig::new().with_max_concurrent_processes(2);
//! let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
//! let archives = Arc::new(ResultArchiveManager::new(config.archive.clone(), fs.clone()));
//! let model = Arc::new(StaticModel::load("model.toml".as_ref())?);
//!
//! let manager = ProcessGroupManager::new(
//!     config,
//!     Arc::new(TokioLauncher),
//!     archives,
//!     model,
//!     Arc::new(TracingProgress),
//!     fs,
//! );
//! manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
//! manager.wait_idle().await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod launcher;
pub mod model;
pub mod option_file;
pub mod process_group;
pub mod progress;
pub mod remote;
pub mod stage;
pub mod types;

pub use batch::RecoveryBatch;
pub use config::{RecoveryConfig, RemoteConfig, NPATH_ENV};
pub use error::{ConfigError, LaunchError, RecoveryError, Result, StageError};
pub use launcher::{KillSwitch, ProcessHandle, ProcessLauncher, ProcessRequest, TokioLauncher};
pub use model::{
    EventSpec, GageOptions, LicenseFlags, ModeRequest, ModelProvider, ModesOptions, PartInfo,
    SolverOptions, StaticModel, StrainCoatOptions, StressOptions, TimeWindow, VtfExport,
};
pub use option_file::{OptionFileWriter, OptionValue};
pub use process_group::{GroupStats, KillScope, ProcessGroupManager, StageEvent};
pub use progress::{ProgressSink, TracingProgress};
pub use remote::{find_remote_path, RemotePathError};
pub use stage::{
    FeFatigueStage, GageStage, InputReport, ModesStage, RecoveryStage, RunState, RunningGroups,
    SolverStage, StageContext, StartStatus, StrainCoatStage, StressStage, VtfSlot,
};
pub use types::{PartId, StageKey, StageKind, StageStatus, StageTicket};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving recovery runs
    pub use crate::{
        KillScope, ProcessGroupManager, RecoveryBatch, RecoveryConfig, RecoveryStage,
        SolverStage, StageEvent, StageKind, StaticModel, TokioLauncher, TracingProgress,
    };
    pub use rcy_archive::{FileSystem, LocalFileSystem, ResultArchiveManager, ScenarioId};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
