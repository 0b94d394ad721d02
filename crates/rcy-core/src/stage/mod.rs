//! Recovery stages
//!
//! One [`RecoveryStage`] implementation per solver kind. The process group
//! manager drives each stage through four steps:
//! 1. `check_dependencies`, a readiness verdict from the archive and the
//!    run state of sibling stages
//! 2. `create_input`, which resolves the run directory and writes option files
//! 3. `start_process`, which launches the solver
//! 4. `on_process_death`, which reports the outcome
//!
//! Stages hold no model objects; everything is read through the
//! [`StageContext`] passed to each step.

pub mod base;
pub mod fatigue;
pub mod gage;
pub mod modes;
pub mod solver;
pub mod strain_coat;
pub mod stress;

pub use fatigue::FeFatigueStage;
pub use gage::GageStage;
pub use modes::ModesStage;
pub use solver::SolverStage;
pub use strain_coat::StrainCoatStage;
pub use stress::StressStage;

use crate::config::RecoveryConfig;
use crate::launcher::{ProcessHandle, ProcessLauncher};
use crate::model::ModelProvider;
use crate::progress::ProgressSink;
use crate::types::{PartId, StageKey, StageKind, StageStatus};
use rcy_archive::{FileSystem, ResultArchive, ResultArchiveManager, ScenarioId};
use std::collections::HashSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Which stage groups are running, per scenario
pub trait RunState: Send + Sync {
    /// Check if a stage of `kind` is live for `scenario`
    fn is_group_running(&self, kind: StageKind, scenario: ScenarioId) -> bool;
}

/// Plain set of running (scenario, kind) pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningGroups(HashSet<(ScenarioId, StageKind)>);

impl RunningGroups {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a group as running
    pub fn insert(&mut self, scenario: ScenarioId, kind: StageKind) {
        self.0.insert((scenario, kind));
    }

    /// Number of running groups
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if nothing runs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ScenarioId, StageKind)> for RunningGroups {
    fn from_iter<I: IntoIterator<Item = (ScenarioId, StageKind)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl RunState for RunningGroups {
    fn is_group_running(&self, kind: StageKind, scenario: ScenarioId) -> bool {
        self.0.contains(&(scenario, kind))
    }
}

/// Everything a stage may read or ask for
pub struct StageContext<'a> {
    /// Snapshot of the stage's scenario archive
    pub archive: &'a ResultArchive,
    /// Archive manager, for run directory creation
    pub archives: &'a ResultArchiveManager,
    /// Run state of sibling stages
    pub running: &'a dyn RunState,
    /// Model data
    pub model: &'a dyn ModelProvider,
    /// Orchestration settings
    pub config: &'a RecoveryConfig,
    /// Progress reporting
    pub progress: &'a dyn ProgressSink,
    /// Filesystem access
    pub fs: &'a dyn FileSystem,
}

/// Outcome of input preparation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputReport {
    /// Readiness after preparation
    pub status: StageStatus,
    /// Run directory, when ready
    pub run_dir: Option<PathBuf>,
}

impl InputReport {
    /// Inputs written, the process may start in `run_dir`
    #[must_use]
    pub fn ready(run_dir: PathBuf) -> Self {
        Self {
            status: StageStatus::ReadyToRun,
            run_dir: Some(run_dir),
        }
    }

    /// Preparation stopped with a non-ready verdict
    #[must_use]
    pub fn halted(status: StageStatus) -> Self {
        Self {
            status,
            run_dir: None,
        }
    }
}

/// Outcome of a launch attempt
#[derive(Debug)]
pub enum StartStatus {
    /// The process is live
    Started(ProcessHandle),
    /// The process could not be started
    NotExecutable(String),
}

/// VTF export slot assigned to one stage of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtfSlot {
    /// Shared output file
    pub file: PathBuf,
    /// First result block number of this stage
    pub first_block: usize,
    /// Express format
    pub express: bool,
    /// Total number of parts, given to the last stage of the batch
    pub parts: Option<usize>,
}

/// One solver run for one scenario (and part)
pub trait RecoveryStage: Send + Debug {
    /// Stage identity
    fn key(&self) -> &StageKey;

    /// Readiness verdict
    fn check_dependencies(&mut self, ctx: &StageContext<'_>) -> StageStatus;

    /// Resolve the run directory and write the solver's option files
    fn create_input(&mut self, ctx: &StageContext<'_>) -> InputReport;

    /// Launch the solver in `run_dir`
    fn start_process(
        &mut self,
        run_dir: &Path,
        ctx: &StageContext<'_>,
        launcher: &dyn ProcessLauncher,
    ) -> StartStatus;

    /// Report the outcome of the solver run
    fn on_process_death(&mut self, exit_code: i32, ctx: &StageContext<'_>);

    /// Report that the run was terminated by the user
    fn on_cancelled(&mut self, progress: &dyn ProgressSink);

    /// Shared output file written by this stage, if any
    fn vtf_output(&self) -> Option<&Path> {
        None
    }

    /// FE part the stage works on
    fn part(&self) -> Option<&PartId> {
        self.key().part.as_ref()
    }
}
