//! Mode shape expansion stage

use crate::error::StageError;
use crate::launcher::ProcessLauncher;
use crate::model::{ModeRequest, PartInfo};
use crate::option_file::{format_real, OptionFileWriter};
use crate::progress::ProgressSink;
use crate::stage::base::{RecoveryBase, EIGENVALUE_SUB_TASK, RESULT_CATEGORY};
use crate::stage::stress::add_vtf_slot;
use crate::stage::{InputReport, RecoveryStage, StageContext, StartStatus, VtfSlot};
use crate::types::{PartId, StageKey, StageKind, StageStatus};
use rcy_archive::ScenarioId;
use std::path::{Path, PathBuf};
use tracing::info;

/// Expands eigenmodes of one FE part
#[derive(Debug, Clone)]
pub struct ModesStage {
    base: RecoveryBase,
    vtf: Option<VtfSlot>,
}

impl ModesStage {
    /// Create a mode shape expansion stage
    #[must_use]
    pub fn new(scenario: ScenarioId, part: PartId) -> Self {
        Self {
            base: RecoveryBase::new(StageKey::for_part(scenario, StageKind::Modes, part)),
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
        let options = ctx.model.modes_options();
        let run_dir = self.base.resolve_run_dir(ctx)?;
        self.base.set_add_options(&options.add_options);

        let mut solver_results = RecoveryBase::results_of(ctx, StageKind::Solver.sub_task());
        solver_results.extend(RecoveryBase::results_of(ctx, EIGENVALUE_SUB_TASK));
        let mut fco = OptionFileWriter::new(self.base.option_file(&run_dir, "fco"));
        fco.add_comment(&format!("Mode shape expansion input for {}", part.id));
        RecoveryBase::add_part_inputs(&mut fco, part, &run_dir, &solver_results, ctx);
        if options.damped {
            fco.add("-damped", true);
        }

        let next = RecoveryBase::next_increment_in(ctx, &run_dir, RESULT_CATEGORY);
        let mut fop = OptionFileWriter::new(self.base.option_file(&run_dir, "fop"));
        fop.add_comment("Mode shape expansion output")
            .add("-resfile", format!("{}.res", StageKind::Modes.solver_name()))
            .add("-rdbfile", format!("{}.{RESULT_CATEGORY}", part.base_name()))
            .add("-rdbinc", next)
            .add_raw("-recover_modes", mode_selection(&options.modes));
        if let Some(slot) = &self.vtf {
            if ctx.model.licenses().vtf_export {
                add_vtf_slot(&mut fop, slot, &run_dir, ctx.model.model_dir());
            }
        }

        self.base.write_option_files(&fco, &fop, ctx)?;
        Ok(run_dir)
    }
}

/// Mode selection in solver list syntax, grouped by time
///
/// `[(0.5, 1), (0.5, 3), (1.0, 2)]` becomes `<<0.5,1,3>,<1,2>>`. Groups keep
/// the order in which their time first appears.
#[must_use]
pub fn mode_selection(modes: &[ModeRequest]) -> String {
    let mut groups: Vec<(f64, Vec<u32>)> = Vec::new();
    for request in modes {
        match groups.iter_mut().find(|(time, _)| (*time - request.time).abs() < f64::EPSILON) {
            Some((_, group)) => group.push(request.mode),
            None => groups.push((request.time, vec![request.mode])),
        }
    }
    let inner = groups
        .iter()
        .map(|(time, group)| {
            let mut item = format_real(*time);
            for mode in group {
                item.push(',');
                item.push_str(&mode.to_string());
            }
            format!("<{item}>")
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("<{inner}>")
}

impl RecoveryStage for ModesStage {
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
        let options = ctx.model.modes_options();
        if !options.solve_eigenvalues {
            info!("  -> Eigenvalue analysis is switched off, no mode shapes to expand");
            return StageStatus::ResultsOk;
        }
        if options.modes.is_empty() {
            info!("  -> No modes are selected for shape expansion");
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

    fn vtf_output(&self) -> Option<&Path> {
        self.vtf.as_ref().map(|slot| slot.file.as_path())
    }
}
