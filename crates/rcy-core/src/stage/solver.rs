//! Dynamics solver stage
//!
//! Produces the primary time histories every recovery stage depends on. The
//! solver input file is written into the task directory so later stages can
//! reference it; results land in `timehist_prim`.

use crate::launcher::ProcessLauncher;
use crate::option_file::OptionFileWriter;
use crate::progress::ProgressSink;
use crate::stage::base::{relative_path, RecoveryBase, RESULT_CATEGORY, SOLVER_INPUT_FILE};
use crate::stage::{InputReport, RecoveryStage, StageContext, StartStatus};
use crate::types::{StageKey, StageKind, StageStatus};
use crate::error::StageError;
use rcy_archive::{ScenarioId, TaskPath};
use std::path::{Path, PathBuf};

/// Result file base name of the primary time history
const RESULT_BASE: &str = "th_p";

/// Runs the dynamics solver for one scenario
#[derive(Debug, Clone)]
pub struct SolverStage {
    base: RecoveryBase,
}

impl SolverStage {
    /// Create a solver stage
    #[must_use]
    pub fn new(scenario: ScenarioId) -> Self {
        Self {
            base: RecoveryBase::new(StageKey::new(scenario, StageKind::Solver)),
        }
    }

    fn write_inputs(&mut self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        let options = ctx.model.solver_options();
        let scenario = self.base.key().scenario;

        let task_dir = ctx.archives.ensure_sub_task_dir(scenario, &TaskPath::root())?;
        let fsi = task_dir.join(SOLVER_INPUT_FILE);
        ctx.fs
            .write_file(&fsi, options.input.as_bytes())
            .map_err(|e| StageError::write(&fsi, e))?;

        let run_dir = self.base.resolve_run_dir(ctx)?;
        self.base.set_add_options(&options.add_options);

        let mut fco = OptionFileWriter::new(self.base.option_file(&run_dir, "fco"));
        fco.add_comment("Dynamics solver input")
            .add("-fsifile", relative_path(&run_dir, &fsi));

        let next = RecoveryBase::next_increment_in(ctx, &run_dir, RESULT_CATEGORY);
        let mut fop = OptionFileWriter::new(self.base.option_file(&run_dir, "fop"));
        fop.add_comment("Dynamics solver output")
            .add("-resfile", format!("{}.res", StageKind::Solver.solver_name()))
            .add("-rdbfile", format!("{RESULT_BASE}.{RESULT_CATEGORY}"))
            .add("-rdbinc", next);
        RecoveryBase::add_time_window(&mut fop, &options.window);

        self.base.write_option_files(&fco, &fop, ctx)?;
        Ok(run_dir)
    }
}

impl RecoveryStage for SolverStage {
    fn key(&self) -> &StageKey {
        self.base.key()
    }

    fn check_dependencies(&mut self, _ctx: &StageContext<'_>) -> StageStatus {
        StageStatus::ReadyToRun
    }

    fn create_input(&mut self, ctx: &StageContext<'_>) -> InputReport {
        match self.write_inputs(ctx) {
            Ok(run_dir) => InputReport::ready(run_dir),
            Err(e) => InputReport::halted(StageStatus::not_executable(e.to_string())),
        }
    }

    fn start_process(
        &mut self,
        run_dir: &Path,
        ctx: &StageContext<'_>,
        launcher: &dyn ProcessLauncher,
    ) -> StartStatus {
        self.base.start_recovery(run_dir, ctx, launcher)
    }

    fn on_process_death(&mut self, exit_code: i32, ctx: &StageContext<'_>) {
        self.base.report_death(exit_code, ctx.progress);
    }

    fn on_cancelled(&mut self, progress: &dyn ProgressSink) {
        self.base.report_cancelled(progress);
    }
}
