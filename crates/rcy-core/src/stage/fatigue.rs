//! FE fatigue evaluation stage
//!
//! Runs the nCode `ncl` interpreter on the latest damage file of a part.
//! Unlike the FEDEM recovery solvers it takes no option files; the script
//! and the damage file are passed on the command line.

use crate::launcher::{ProcessLauncher, ProcessRequest};
use crate::option_file::portable_path;
use crate::progress::ProgressSink;
use crate::stage::base::RecoveryBase;
use crate::stage::strain_coat::DAMAGE_CATEGORY;
use crate::stage::{InputReport, RecoveryStage, StageContext, StartStatus};
use crate::types::{PartId, StageKey, StageKind, StageStatus};
use rcy_archive::{FileSystem, ScenarioId, TaskPath};
use std::path::{Path, PathBuf};

/// Script run by the interpreter, below `<npath>/nsdata`
pub const FATIGUE_SCRIPT: &str = "fedem_fatfe";

/// Evaluates FE fatigue of one part from its strain coat damage file
#[derive(Debug, Clone)]
pub struct FeFatigueStage {
    base: RecoveryBase,
    damage_file: Option<PathBuf>,
    npath: Option<PathBuf>,
}

impl FeFatigueStage {
    /// Create an FE fatigue stage
    #[must_use]
    pub fn new(scenario: ScenarioId, part: PartId) -> Self {
        Self {
            base: RecoveryBase::new(StageKey::for_part(scenario, StageKind::FeFatigue, part)),
            damage_file: None,
            npath: None,
        }
    }

    /// Damage file selected by the last dependency check
    #[inline]
    #[must_use]
    pub fn damage_file(&self) -> Option<&Path> {
        self.damage_file.as_deref()
    }

    fn latest_damage_file(&self, part: &PartId, ctx: &StageContext<'_>) -> Option<PathBuf> {
        let path = TaskPath::new([StageKind::FeFatigue.sub_task(), part.as_str()]).ok()?;
        let name = ctx.archive.sub_task(&path)?.latest(DAMAGE_CATEGORY)?;
        let file = ctx.archive.dir_of(&path)?.join(name);
        ctx.fs.is_file(&file).then_some(file)
    }
}

/// Interpreter to run: configured override, then the nCode installation,
/// then whatever `ncl` resolves to on the search path
fn interpreter(npath: &Path, ctx: &StageContext<'_>) -> String {
    let solver = StageKind::FeFatigue.solver_name();
    if ctx.config.executables.contains_key(solver) {
        return ctx.config.executable(solver);
    }
    find_interpreter(npath, ctx.fs).unwrap_or_else(|| solver.to_string())
}

fn find_interpreter(npath: &Path, fs: &dyn FileSystem) -> Option<String> {
    let name = format!("{}{}", StageKind::FeFatigue.solver_name(), std::env::consts::EXE_SUFFIX);
    ["bin", "nsoft"]
        .iter()
        .map(|dir| npath.join(dir).join(&name))
        .find(|candidate| fs.is_file(candidate))
        .map(|found| found.display().to_string())
}

impl RecoveryStage for FeFatigueStage {
    fn key(&self) -> &StageKey {
        self.base.key()
    }

    fn check_dependencies(&mut self, ctx: &StageContext<'_>) -> StageStatus {
        if let Some(status) = self.base.check_license(ctx) {
            return status;
        }
        let part = match self.base.part_info(ctx) {
            Ok(part) => part.id,
            Err(status) => return status,
        };

        if ctx
            .running
            .is_group_running(StageKind::StrainCoat, self.base.key().scenario)
        {
            return StageStatus::PendingButWait;
        }

        let Some(damage) = self.latest_damage_file(&part, ctx) else {
            return StageStatus::not_executable(format!(
                "{part} has no associated damage file (fpp-file). \
                 You need to do a Strain Coat Recovery on the part first."
            ));
        };

        let Some(npath) = ctx.config.resolve_npath() else {
            return StageStatus::not_executable(
                "The npath environment variable is not set. \
                 FE fatigue needs an nCode installation.",
            );
        };
        let script = npath.join("nsdata").join(format!("{FATIGUE_SCRIPT}.ncx"));
        if !ctx.fs.is_file(&script) {
            return StageStatus::not_executable(format!(
                "The FE fatigue script {} does not exist.",
                script.display()
            ));
        }

        self.damage_file = Some(damage);
        self.npath = Some(npath);
        StageStatus::ReadyToRun
    }

    fn create_input(&mut self, ctx: &StageContext<'_>) -> InputReport {
        match self.base.resolve_run_dir(ctx) {
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
        let (Some(damage), Some(npath)) = (&self.damage_file, &self.npath) else {
            return StartStatus::NotExecutable("dependencies were not checked".to_string());
        };
        let request = ProcessRequest::new(interpreter(npath, ctx))
            .with_args(vec![format!("@{FATIGUE_SCRIPT}"), portable_path(damage)])
            .with_working_dir(run_dir);
        self.base.launch(&request, run_dir, ctx, launcher)
    }

    fn on_process_death(&mut self, exit_code: i32, ctx: &StageContext<'_>) {
        self.base.report_death(exit_code, ctx.progress);
    }

    fn on_cancelled(&mut self, progress: &dyn ProgressSink) {
        self.base.report_cancelled(progress);
    }
}
