//! Strain gage recovery stage
//!
//! Parts without strain rosettes have nothing to recover; the stage then
//! reports [`StageStatus::ResultsOk`] and never launches.

use crate::error::StageError;
use crate::launcher::ProcessLauncher;
use crate::model::PartInfo;
use crate::option_file::OptionFileWriter;
use crate::progress::ProgressSink;
use crate::stage::base::{relative_path, RecoveryBase, RESULT_CATEGORY};
use crate::stage::{InputReport, RecoveryStage, StageContext, StartStatus};
use crate::types::{PartId, StageKey, StageKind, StageStatus};
use rcy_archive::ScenarioId;
use std::path::{Path, PathBuf};
use tracing::info;

/// Rosette definition file written into the run directory
pub const ROSETTE_FILE: &str = "fedem_gage.fsi";

/// Recovers strain rosette histories of one FE part
#[derive(Debug, Clone)]
pub struct GageStage {
    base: RecoveryBase,
}

impl GageStage {
    /// Create a strain gage recovery stage
    #[must_use]
    pub fn new(scenario: ScenarioId, part: PartId) -> Self {
        Self {
            base: RecoveryBase::new(StageKey::for_part(scenario, StageKind::Gage, part)),
        }
    }

    fn write_inputs(&mut self, part: &PartInfo, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        let options = ctx.model.gage_options();
        let run_dir = self.base.resolve_run_dir(ctx)?;
        self.base.set_add_options(&options.add_options);

        let rosettes = run_dir.join(ROSETTE_FILE);
        let mut content = part.rosettes.join("\n");
        content.push('\n');
        ctx.fs
            .write_file(&rosettes, content.as_bytes())
            .map_err(|e| StageError::write(&rosettes, e))?;

        let solver_results = RecoveryBase::results_of(ctx, StageKind::Solver.sub_task());
        let mut fco = OptionFileWriter::new(self.base.option_file(&run_dir, "fco"));
        fco.add_comment(&format!("Strain gage recovery input for {}", part.id));
        RecoveryBase::add_part_inputs(&mut fco, part, &run_dir, &solver_results, ctx);
        fco.add("-rosfile", relative_path(&run_dir, &rosettes));
        if options.fatigue {
            let scale = ctx.model.stress_to_mpa_scale();
            fco.add("-fatigue", true)
                .add("-stressToMPaScale", scale)
                .add("-binSize", options.bin_size * scale);
        }

        let next = RecoveryBase::next_increment_in(ctx, &run_dir, RESULT_CATEGORY);
        let mut fop = OptionFileWriter::new(self.base.option_file(&run_dir, "fop"));
        fop.add_comment("Strain gage recovery output")
            .add("-resfile", format!("{}.res", StageKind::Gage.solver_name()))
            .add("-rdbfile", format!("{}.{RESULT_CATEGORY}", part.base_name()))
            .add("-rdbinc", next);
        RecoveryBase::add_time_window(&mut fop, &options.window);
        fop.add("-dac_sampleinc", options.dac_sample_rate.unwrap_or(-1.0));

        self.base.write_option_files(&fco, &fop, ctx)?;
        Ok(run_dir)
    }
}

impl RecoveryStage for GageStage {
    fn key(&self) -> &StageKey {
        self.base.key()
    }

    fn check_dependencies(&mut self, ctx: &StageContext<'_>) -> StageStatus {
        if let Some(status) = self.base.check_license(ctx) {
            return status;
        }
        let part = match self.base.part_info(ctx) {
            Ok(part) => part,
            Err(status) => return status,
        };
        if part.rosettes.is_empty() {
            info!("  -> {} does not have any strain rosettes", part.id);
            return StageStatus::ResultsOk;
        }
        self.base.check_solver_results(ctx)
    }

    fn create_input(&mut self, ctx: &StageContext<'_>) -> InputReport {
        let part = match self.base.part_info(ctx) {
            Ok(part) => part,
            Err(status) => return InputReport::halted(status),
        };
        match self.write_inputs(&part, ctx) {
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
