//! Stress recovery stage

use crate::error::StageError;
use crate::launcher::ProcessLauncher;
use crate::model::{PartInfo, StressOptions};
use crate::option_file::OptionFileWriter;
use crate::progress::ProgressSink;
use crate::stage::base::{relative_path, RecoveryBase, RESULT_CATEGORY};
use crate::stage::{InputReport, RecoveryStage, StageContext, StartStatus, VtfSlot};
use crate::types::{PartId, StageKey, StageKind, StageStatus};
use rcy_archive::ScenarioId;
use std::path::{Path, PathBuf};

/// Recovers stresses and strains of one FE part
#[derive(Debug, Clone)]
pub struct StressStage {
    base: RecoveryBase,
    vtf: Option<VtfSlot>,
}

impl StressStage {
    /// Create a stress recovery stage
    #[must_use]
    pub fn new(scenario: ScenarioId, part: PartId) -> Self {
        Self {
            base: RecoveryBase::new(StageKey::for_part(scenario, StageKind::Stress, part)),
            vtf: None,
        }
    }

    /// Assign a slot in a shared VTF file
    #[inline]
    #[must_use]
    pub fn with_vtf(mut self, slot: VtfSlot) -> Self {
        self.vtf = Some(slot);
        self
    }

    /// Assigned VTF slot
    #[inline]
    #[must_use]
    pub fn vtf(&self) -> Option<&VtfSlot> {
        self.vtf.as_ref()
    }

    fn write_inputs(&mut self, part: &PartInfo, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        let options = ctx.model.stress_options();
        let run_dir = self.base.resolve_run_dir(ctx)?;
        self.base.set_add_options(&options.add_options);

        let solver_results = RecoveryBase::results_of(ctx, StageKind::Solver.sub_task());
        let mut fco = OptionFileWriter::new(self.base.option_file(&run_dir, "fco"));
        fco.add_comment(&format!("Stress recovery input for {}", part.id));
        RecoveryBase::add_part_inputs(&mut fco, part, &run_dir, &solver_results, ctx);
        if let Some(residual) = &part.residual_stress_file {
            fco.add(
                "-resStressFile",
                relative_path(&run_dir, &ctx.model.model_dir().join(residual)),
            );
        }

        let next = RecoveryBase::next_increment_in(ctx, &run_dir, RESULT_CATEGORY);
        let mut fop = OptionFileWriter::new(self.base.option_file(&run_dir, "fop"));
        fop.add_comment("Stress recovery output")
            .add("-resfile", format!("{}.res", StageKind::Stress.solver_name()))
            .add("-rdbfile", format!("{}.{RESULT_CATEGORY}", part.base_name()))
            .add("-rdbinc", next);
        RecoveryBase::add_time_window(&mut fop, &options.window);
        add_output_flags(&mut fop, &options);

        if let Some(slot) = &self.vtf {
            if ctx.model.licenses().vtf_export {
                add_vtf_slot(&mut fop, slot, &run_dir, ctx.model.model_dir());
            }
        }

        self.base.write_option_files(&fco, &fop, ctx)?;
        Ok(run_dir)
    }
}

fn add_output_flags(fop: &mut OptionFileWriter, options: &StressOptions) {
    fop.add("-deformation", options.deformation)
        .add("-stressTensor", options.stress_tensor)
        .add("-strainTensor", options.strain_tensor)
        .add("-vmStress", options.von_mises_stress)
        .add("-vmStrain", options.von_mises_strain)
        .add("-maxPStress", options.max_principal_stress)
        .add("-minPStress", options.min_principal_stress)
        .add("-maxSStress", options.max_shear_stress);
}

/// VTF options shared by stress recovery and mode expansion
pub(crate) fn add_vtf_slot(fop: &mut OptionFileWriter, slot: &VtfSlot, run_dir: &Path, model_dir: &Path) {
    let file = if slot.file.is_absolute() {
        slot.file.clone()
    } else {
        model_dir.join(&slot.file)
    };
    let flag = if slot.express { "-VTFexpress" } else { "-VTFfile" };
    fop.add(flag, relative_path(run_dir, &file));
    fop.add("-VTFoffset", i64::try_from(slot.first_block).unwrap_or(i64::MAX));
    if let Some(parts) = slot.parts {
        fop.add("-VTFparts", i64::try_from(parts).unwrap_or(i64::MAX));
    }
}

impl RecoveryStage for StressStage {
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

    fn vtf_output(&self) -> Option<&Path> {
        self.vtf.as_ref().map(|slot| slot.file.as_path())
    }
}
