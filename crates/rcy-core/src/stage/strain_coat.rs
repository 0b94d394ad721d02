//! Strain coat recovery stage
//!
//! Writes a damage file (`.fpp`) per run, numbered like the result files,
//! which the FE fatigue stage picks up.

use crate::error::StageError;
use crate::launcher::ProcessLauncher;
use crate::model::PartInfo;
use crate::option_file::OptionFileWriter;
use crate::progress::ProgressSink;
use crate::stage::base::{relative_path, RecoveryBase, RESULT_CATEGORY};
use crate::stage::{InputReport, RecoveryStage, StageContext, StartStatus};
use crate::types::{PartId, StageKey, StageKind, StageStatus};
use rcy_archive::{numbered_file_name, ScenarioId};
use std::path::{Path, PathBuf};

/// Category of damage files
pub const DAMAGE_CATEGORY: &str = "fpp";

/// Recovers strain coat summaries of one FE part
#[derive(Debug, Clone)]
pub struct StrainCoatStage {
    base: RecoveryBase,
}

impl StrainCoatStage {
    /// Create a strain coat recovery stage
    #[must_use]
    pub fn new(scenario: ScenarioId, part: PartId) -> Self {
        Self {
            base: RecoveryBase::new(StageKey::for_part(scenario, StageKind::StrainCoat, part)),
        }
    }

    fn write_inputs(&mut self, part: &PartInfo, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        let options = ctx.model.strain_coat_options();
        let scale = ctx.model.stress_to_mpa_scale();
        let run_dir = self.base.resolve_run_dir(ctx)?;
        self.base.set_add_options(&options.add_options);

        let solver_results = RecoveryBase::results_of(ctx, StageKind::Solver.sub_task());
        let mut fco = OptionFileWriter::new(self.base.option_file(&run_dir, "fco"));
        fco.add_comment(&format!("Strain coat recovery input for {}", part.id));
        RecoveryBase::add_part_inputs(&mut fco, part, &run_dir, &solver_results, ctx);
        if let Some(residual) = &part.residual_stress_file {
            fco.add(
                "-resStressFile",
                relative_path(&run_dir, &ctx.model.model_dir().join(residual)),
            );
        }
        fco.add("-blockSize", options.elements_together)
            .add("-biAxialGate", options.biaxial_gate)
            .add("-stressToMPaScale", scale);
        if options.rainflow {
            fco.add("-PVXGate", options.pvx_gate * scale)
                .add("-HistDataType", options.hist_data_type);
            if let Some(sn) = &options.sn_file {
                fco.add("-SNfile", relative_path(&run_dir, &ctx.model.model_dir().join(sn)));
            }
        }

        let next_fpp = RecoveryBase::next_increment_in(ctx, &run_dir, DAMAGE_CATEGORY);
        let next_frs = RecoveryBase::next_increment_in(ctx, &run_dir, RESULT_CATEGORY);
        let fpp_base = format!("{}_fpp", part.base_name());
        let mut fop = OptionFileWriter::new(self.base.option_file(&run_dir, "fop"));
        fop.add_comment("Strain coat recovery output")
            .add("-resfile", format!("{}.res", StageKind::StrainCoat.solver_name()))
            .add("-fppfile", numbered_file_name(&fpp_base, next_fpp, DAMAGE_CATEGORY))
            .add("-rdbfile", format!("{}.{RESULT_CATEGORY}", part.base_name()))
            .add("-rdbinc", next_frs);
        RecoveryBase::add_time_window(&mut fop, &options.window);

        self.base.write_option_files(&fco, &fop, ctx)?;
        Ok(run_dir)
    }
}

impl RecoveryStage for StrainCoatStage {
    fn key(&self) -> &StageKey {
        self.base.key()
    }

    fn check_dependencies(&mut self, ctx: &StageContext<'_>) -> StageStatus {
        if let Some(status) = self.base.check_license(ctx) {
            return status;
        }
        if let Err(status) = self.base.part_info(ctx) {
            return status;
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
