//! Behavior shared by every recovery stage
//!
//! [`RecoveryBase`] is embedded by each stage. It answers the common
//! dependency question (are there solver results for this scenario), resolves
//! run directories, writes the FE part inputs every recovery solver reads,
//! and builds the standard command line.

use crate::launcher::ProcessRequest;
use crate::model::{PartInfo, TimeWindow};
use crate::option_file::{portable_path, OptionFileWriter};
use crate::progress::ProgressSink;
use crate::remote::find_remote_path;
use crate::stage::{StageContext, StartStatus};
use crate::types::{StageKey, StageKind, StageStatus};
use crate::error::StageError;
use crate::launcher::ProcessLauncher;
use rcy_archive::increment::category_of;
use rcy_archive::{next_increment, TaskPath};
use std::path::{Component, Path, PathBuf};
use tracing::{error, info, warn};

/// Solver input file written by the dynamics solver stage into the task
/// directory
pub const SOLVER_INPUT_FILE: &str = "fedem_solver.fsi";

/// Category of time history result files
pub const RESULT_CATEGORY: &str = "frs";

/// Sub-task of the dynamics solver's eigenvalue results
pub const EIGENVALUE_SUB_TASK: &str = "eigval";

/// State and helpers shared by all stages
#[derive(Debug, Clone)]
pub struct RecoveryBase {
    key: StageKey,
    run_dir: Option<PathBuf>,
    add_options: String,
    started: bool,
}

impl RecoveryBase {
    /// Create the shared part of a stage
    #[must_use]
    pub fn new(key: StageKey) -> Self {
        Self {
            key,
            run_dir: None,
            add_options: String::new(),
            started: false,
        }
    }

    /// Stage identity
    #[inline]
    #[must_use]
    pub fn key(&self) -> &StageKey {
        &self.key
    }

    /// Solver kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.key.kind
    }

    /// Run directory, once resolved
    #[inline]
    #[must_use]
    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    /// Remember the user's extra options for the `.fao` file and `-terminal`
    pub fn set_add_options(&mut self, options: &str) {
        self.add_options = options.trim().to_string();
    }

    /// Who the stage works for, e.g. `part1 in event 2`
    #[must_use]
    pub fn target(&self) -> String {
        match &self.key.part {
            Some(part) => format!("{part} in {}", self.key.scenario),
            None => self.key.scenario.to_string(),
        }
    }

    /// Verdict for a missing license
    #[must_use]
    pub fn check_license(&self, ctx: &StageContext<'_>) -> Option<StageStatus> {
        if ctx.model.licenses().allows(self.key.kind) {
            return None;
        }
        Some(StageStatus::not_executable(format!(
            "{} recovery is not licensed",
            self.key.kind.label()
        )))
    }

    /// Look up the stage's FE part
    ///
    /// # Errors
    /// Returns a not-executable verdict if the stage has no part or the model
    /// does not know it.
    pub fn part_info(&self, ctx: &StageContext<'_>) -> Result<PartInfo, StageStatus> {
        let Some(id) = &self.key.part else {
            return Err(StageStatus::not_executable(format!(
                "{} needs an FE part",
                self.key.kind.solver_name()
            )));
        };
        ctx.model
            .part(id)
            .ok_or_else(|| StageStatus::not_executable(StageError::UnknownPart(id.to_string()).to_string()))
    }

    /// Common dependency check: solver results must exist for the scenario
    ///
    /// - Solver running for the scenario → wait
    /// - No solver result file → not executable
    /// - No solver input file → not executable
    #[must_use]
    pub fn check_solver_results(&self, ctx: &StageContext<'_>) -> StageStatus {
        let scenario = self.key.scenario;
        if ctx.running.is_group_running(StageKind::Solver, scenario) {
            return StageStatus::PendingButWait;
        }

        let latest = TaskPath::single(StageKind::Solver.sub_task())
            .ok()
            .and_then(|path| ctx.archive.sub_task(&path))
            .and_then(|prim| prim.latest(RESULT_CATEGORY));
        if latest.is_none() {
            return StageStatus::not_executable(format!(
                "No solver results found for {scenario}. Run the dynamics solver first."
            ));
        }
        if !ctx.archive.root().contains(SOLVER_INPUT_FILE) {
            return StageStatus::not_executable(format!(
                "The solver input file {SOLVER_INPUT_FILE} is missing for {scenario}."
            ));
        }
        StageStatus::ReadyToRun
    }

    /// Create the stage's run directory, `<sub-task>[/<part>]`
    ///
    /// # Errors
    /// Returns [`StageError::RunDirectory`] if the directory cannot be made.
    pub fn resolve_run_dir(&mut self, ctx: &StageContext<'_>) -> Result<PathBuf, StageError> {
        let mut segments = vec![self.key.kind.sub_task().to_string()];
        if let Some(part) = &self.key.part {
            segments.push(part.to_string());
        }
        let path = TaskPath::new(segments).map_err(rcy_archive::ArchiveError::from)?;
        let dir = ctx.archives.ensure_sub_task_dir(self.key.scenario, &path)?;
        self.run_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Absolute path of the solver input file of the scenario
    #[must_use]
    pub fn solver_input_file(ctx: &StageContext<'_>) -> PathBuf {
        ctx.archive.task_dir().join(SOLVER_INPUT_FILE)
    }

    /// Absolute paths of the result files in one sub-task of the root task
    #[must_use]
    pub fn results_of(ctx: &StageContext<'_>, sub_task: &str) -> Vec<PathBuf> {
        let Ok(path) = TaskPath::single(sub_task) else {
            return Vec::new();
        };
        let (Some(node), Some(dir)) = (ctx.archive.sub_task(&path), ctx.archive.dir_of(&path))
        else {
            return Vec::new();
        };
        node.files(RESULT_CATEGORY).map(|f| dir.join(f)).collect()
    }

    /// Next free increment of a category in the run directory
    #[must_use]
    pub fn next_increment_in(ctx: &StageContext<'_>, run_dir: &Path, category: &str) -> u32 {
        let listing = ctx.fs.list_files(run_dir).unwrap_or_default();
        let names = listing
            .iter()
            .filter(|p| p.components().count() == 1)
            .filter_map(|p| p.to_str())
            .filter(|name| category_of(name) == category);
        next_increment(names, category)
    }

    /// Write the FE part inputs every recovery solver reads
    ///
    /// Link data, reduced matrices, the solver input file and the solver's
    /// result files, all relative to the run directory.
    pub fn add_part_inputs(
        fco: &mut OptionFileWriter,
        part: &PartInfo,
        run_dir: &Path,
        solver_results: &[PathBuf],
        ctx: &StageContext<'_>,
    ) {
        let model_dir = ctx.model.model_dir();
        let reduced = |suffix: &str| relative_path(run_dir, &part.reduced_file(model_dir, suffix));

        fco.add("-linkId", part.base_id)
            .add("-linkfile", relative_path(run_dir, &part.fe_data_file(model_dir)))
            .add("-Bmatfile", reduced("B.fmx"));
        if part.component_modes > 0 {
            fco.add("-eigfile", reduced("E.fmx"));
        } else {
            fco.add("-dispfile", reduced("D.fmx"));
        }
        fco.add("-samfile", reduced("SAM.fsm"))
            .add("-fsifile", relative_path(run_dir, &Self::solver_input_file(ctx)))
            .add_raw("-frsfile", file_list(run_dir, solver_results));
    }

    /// Write the time window options
    pub fn add_time_window(fop: &mut OptionFileWriter, window: &TimeWindow) {
        fop.add("-statm", window.start).add("-stotm", window.stop);
        if window.all_steps {
            fop.add("-allTimeSteps", true);
        } else {
            fop.add("-tinc", window.increment);
        }
    }

    /// Write the `.fco`, `.fop` and (with extra options) `.fao` files
    ///
    /// # Errors
    /// Returns [`StageError::Write`] on the first failed write.
    pub fn write_option_files(
        &self,
        fco: &OptionFileWriter,
        fop: &OptionFileWriter,
        ctx: &StageContext<'_>,
    ) -> Result<(), StageError> {
        fco.write(ctx.fs)?;
        fop.write(ctx.fs)?;
        if !self.add_options.is_empty() {
            if let Some(dir) = fco.path().and_then(Path::parent) {
                let mut fao = OptionFileWriter::new(
                    dir.join(format!("{}.fao", self.key.kind.solver_name())),
                );
                fao.add_verbatim(&self.add_options);
                fao.write(ctx.fs)?;
            }
        }
        Ok(())
    }

    /// Option file path in the run directory, e.g. `fedem_gage.fco`
    #[must_use]
    pub fn option_file(&self, run_dir: &Path, extension: &str) -> PathBuf {
        run_dir.join(format!("{}.{extension}", self.key.kind.solver_name()))
    }

    /// Launch the solver with the standard arguments
    ///
    /// `-fco`, `-fop`, `-fao` (with extra options), `-consolemsg`, and
    /// `-terminal 7` in batch mode or `-terminal -1` when several solvers may
    /// share the console. With a remote peer the run directory is passed as
    /// `-cwd` and the command is prefixed.
    pub fn start_recovery(
        &mut self,
        run_dir: &Path,
        ctx: &StageContext<'_>,
        launcher: &dyn ProcessLauncher,
    ) -> StartStatus {
        let solver = self.key.kind.solver_name();
        let mut args = OptionFileWriter::args();
        let mut request = ProcessRequest::new(ctx.config.executable(solver));

        match &ctx.config.remote {
            Some(remote) if ctx.model.licenses().remote_solve => {
                match find_remote_path(run_dir, ctx.model.model_dir(), &remote.model_dir) {
                    Ok(cwd) => {
                        args.add("-cwd", cwd);
                        request = request.with_prefix(remote.prefix.clone());
                    }
                    Err(e) => return StartStatus::NotExecutable(e.to_string()),
                }
            }
            Some(_) => {
                warn!("Remote solving is not licensed, running {solver} locally");
                request = request.with_working_dir(run_dir);
            }
            None => request = request.with_working_dir(run_dir),
        }

        args.add("-fco", format!("{solver}.fco"))
            .add("-fop", format!("{solver}.fop"));
        if !self.add_options.is_empty() {
            args.add("-fao", format!("{solver}.fao"));
        }
        args.add("-consolemsg", true);
        if ctx.config.batch_mode {
            args.add("-terminal", 7);
        } else if ctx.config.max_concurrent_processes > 1 && !self.add_options.contains("-terminal") {
            args.add("-terminal", -1);
        }

        let request = request.with_args(args.to_args());
        self.launch(&request, run_dir, ctx, launcher)
    }

    /// Launch an arbitrary request and push the progress status
    pub fn launch(
        &mut self,
        request: &ProcessRequest,
        run_dir: &Path,
        ctx: &StageContext<'_>,
        launcher: &dyn ProcessLauncher,
    ) -> StartStatus {
        let kind = self.key.kind;
        let shown = relative_path(ctx.archives.rdb_root().parent().unwrap_or(Path::new("")), run_dir);
        if kind == StageKind::Solver {
            info!("===> Running {} for {}", kind.label(), self.target());
        } else {
            info!("===> Recovering {} for {}", kind.label(), self.target());
        }
        info!("     Results in {}", portable_path(&shown));

        match launcher.launch(request) {
            Ok(handle) => {
                ctx.progress
                    .push_status(&format!("Recovering {}", kind.label()));
                ctx.progress.set_sub_task(&self.target());
                self.started = true;
                StartStatus::Started(handle)
            }
            Err(e) => {
                error!("===> {e}");
                ctx.progress
                    .list(&format!("===> Could not start: {}", request.command_line()));
                StartStatus::NotExecutable(e.to_string())
            }
        }
    }

    /// Log the outcome of a solver run
    pub fn report_death(&mut self, exit_code: i32, progress: &dyn ProgressSink) {
        let solver = self.key.kind.solver_name();
        if exit_code == 0 {
            info!("===> {solver} done for {}", self.target());
        } else {
            warn!("===> {solver} failed for {} (exit code {exit_code})", self.target());
            if let Some(dir) = &self.run_dir {
                let res = dir.join(format!("{solver}.res"));
                warn!("     See {} for further details.", res.display());
            }
        }
        self.finish(progress);
    }

    /// Log a user termination
    pub fn report_cancelled(&mut self, progress: &dyn ProgressSink) {
        info!(
            "===> {} terminated by user for {}",
            self.key.kind.solver_name(),
            self.target()
        );
        self.finish(progress);
    }

    fn finish(&mut self, progress: &dyn ProgressSink) {
        if self.started {
            progress.pop_status();
            progress.set_sub_task("");
            self.started = false;
        }
    }
}

/// Path of `target` relative to directory `from`
///
/// Falls back to `target` itself when the two share no root.
#[must_use]
pub fn relative_path(from: &Path, target: &Path) -> PathBuf {
    let from_parts: Vec<Component<'_>> = from.components().collect();
    let target_parts: Vec<Component<'_>> = target.components().collect();
    let common = from_parts
        .iter()
        .zip(&target_parts)
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 && (from.has_root() || target.has_root()) {
        return target.to_path_buf();
    }

    let mut out = PathBuf::new();
    for _ in common..from_parts.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part.as_os_str());
    }
    out
}

/// Solver list syntax, `<"a.frs","b.frs">`, relative to the run directory
#[must_use]
pub fn file_list(run_dir: &Path, files: &[PathBuf]) -> String {
    let inner = files
        .iter()
        .map(|f| format!("\"{}\"", portable_path(&relative_path(run_dir, f))))
        .collect::<Vec<_>>()
        .join(",");
    format!("<{inner}>")
}

/// Smallest power of ten not below `n`, the spacing of VTF result blocks
#[must_use]
pub fn block_span(n: usize) -> usize {
    let mut span = 1;
    while span < n {
        span = span.saturating_mul(10);
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn relative_paths_climb_out() {
        assert_eq!(
            relative_path(
                Path::new("/m/model_RDB/response_0001/timehist_rcy_0001/part1_0001"),
                Path::new("/m/model_RDB/response_0001/fedem_solver.fsi"),
            ),
            PathBuf::from("../../fedem_solver.fsi")
        );
        assert_eq!(
            relative_path(Path::new("/m/run"), Path::new("/m/part1_reduced/part1_B.fmx")),
            PathBuf::from("../part1_reduced/part1_B.fmx")
        );
        assert_eq!(relative_path(Path::new("/a"), Path::new("/a")), PathBuf::new());
    }

    #[test]
    fn file_list_is_quoted_and_relative() {
        let list = file_list(
            Path::new("/rdb/response_0001/timehist_rcy_0001/p_0001"),
            &[
                PathBuf::from("/rdb/response_0001/timehist_prim_0001/th_p_001.frs"),
                PathBuf::from("/rdb/response_0001/timehist_prim_0001/th_p_002.frs"),
            ],
        );
        assert_eq!(
            list,
            "<\"../../timehist_prim_0001/th_p_001.frs\",\"../../timehist_prim_0001/th_p_002.frs\">"
        );
        assert_eq!(file_list(Path::new("/x"), &[]), "<>");
    }

    #[test]
    fn block_span_rounds_up_to_power_of_ten() {
        assert_eq!(block_span(0), 1);
        assert_eq!(block_span(1), 1);
        assert_eq!(block_span(7), 10);
        assert_eq!(block_span(10), 10);
        assert_eq!(block_span(11), 100);
        assert_eq!(block_span(202), 1000);
    }

    proptest! {
        #[test]
        fn block_span_is_tight_power_of_ten(n in 1usize..10_000_000) {
            let span = block_span(n);
            prop_assert!(span >= n);
            prop_assert!(span / 10 < n);
            let span_str = span.to_string();
            prop_assert_eq!(span_str.trim_start_matches('1').trim_matches('0'), "");
        }

        #[test]
        fn relative_path_resolves_back(
            from in proptest::collection::vec("[a-z]{1,6}", 0..5),
            to in proptest::collection::vec("[a-z]{1,6}", 1..5),
        ) {
            let from_dir: PathBuf = std::iter::once("/".to_string()).chain(from).collect();
            let target: PathBuf = std::iter::once("/".to_string()).chain(to).collect();
            let mut resolved = from_dir.clone();
            for part in relative_path(&from_dir, &target).components() {
                match part {
                    Component::ParentDir => {
                        resolved.pop();
                    }
                    other => resolved.push(other.as_os_str()),
                }
            }
            prop_assert_eq!(resolved, target);
        }
    }
}
