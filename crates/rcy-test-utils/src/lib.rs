//! Testing utilities for the recovery workspace
//!
//! Shared fakes and fixtures:
//! - [`ScriptedLauncher`], a process launcher whose "processes" exit when
//!   the test says so and leave scripted result files behind
//! - [`RecordingProgress`], a progress sink that keeps every message
//! - [`RecordingFileSystem`], the local disk with a log of every file written
//! - [`Harness`], a temporary model directory wired to a process group manager

#![allow(missing_docs)]

use parking_lot::Mutex;
use rcy_archive::{ArchiveConfig, FileSystem, LocalFileSystem, ResultArchiveManager, ScenarioId};
use rcy_core::{
    LaunchError, PartInfo, ProcessGroupManager, ProcessHandle, ProcessLauncher, ProcessRequest,
    ProgressSink, RecoveryConfig, StageEvent, StaticModel,
};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, oneshot};

/// Exit code reported for killed scripted processes
pub const KILLED_EXIT_CODE: i32 = -9;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const POLL_LIMIT: usize = 2000;

/// Behavior of one scripted program
#[derive(Debug, Clone, Default)]
pub struct ProgramScript {
    /// Files created in the working directory on a zero exit
    pub outputs: Vec<String>,
    /// Exit on its own after this delay, with `exit_code`
    pub auto_exit: Option<Duration>,
    /// Exit code used by `auto_exit`
    pub exit_code: i32,
    /// Refuse to spawn
    pub spawn_error: bool,
}

impl ProgramScript {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn writes(mut self, file: &str) -> Self {
        self.outputs.push(file.to_string());
        self
    }

    #[must_use]
    pub fn exits_after(mut self, delay: Duration, code: i32) -> Self {
        self.auto_exit = Some(delay);
        self.exit_code = code;
        self
    }

    pub fn fails_to_spawn() -> Self {
        Self {
            spawn_error: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct LiveProcess {
    program: String,
    working_dir: Option<PathBuf>,
    outputs: Vec<String>,
    exit: oneshot::Sender<i32>,
}

#[derive(Debug, Default)]
struct LauncherState {
    scripts: HashMap<String, ProgramScript>,
    live: BTreeMap<u32, LiveProcess>,
    launched: Vec<ProcessRequest>,
    next_pid: u32,
    max_live: usize,
}

impl LauncherState {
    fn exit(&mut self, pid: u32, code: i32) -> bool {
        let Some(process) = self.live.remove(&pid) else {
            return false;
        };
        if code == 0 {
            if let Some(dir) = &process.working_dir {
                for name in &process.outputs {
                    std::fs::write(dir.join(name), b"scripted result").unwrap();
                }
            }
        }
        let _ = process.exit.send(code);
        true
    }
}

/// [`ProcessLauncher`] driven by the test
///
/// Programs without a script stay alive until [`ScriptedLauncher::finish`]
/// or a kill.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the script of a program, keyed by executable name
    #[must_use]
    pub fn with_script(self, program: &str, script: ProgramScript) -> Self {
        self.state.lock().scripts.insert(program.to_string(), script);
        self
    }

    pub fn launched(&self) -> Vec<ProcessRequest> {
        self.state.lock().launched.clone()
    }

    pub fn launched_programs(&self) -> Vec<String> {
        self.launched().into_iter().map(|r| r.program).collect()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().max_live
    }

    /// Exit the oldest live process of `program`
    ///
    /// Scripted outputs are written first when `code` is zero.
    pub fn finish(&self, program: &str, code: i32) -> bool {
        let mut state = self.state.lock();
        let pid = state
            .live
            .iter()
            .find(|(_, p)| p.program == program)
            .map(|(pid, _)| *pid);
        pid.is_some_and(|pid| state.exit(pid, code))
    }

    pub async fn wait_for_live(&self, count: usize) {
        self.wait_until(|s| s.live.len() == count).await;
    }

    pub async fn wait_for_launches(&self, count: usize) {
        self.wait_until(|s| s.launched.len() >= count).await;
    }

    async fn wait_until(&self, done: impl Fn(&LauncherState) -> bool) {
        for _ in 0..POLL_LIMIT {
            if done(&self.state.lock()) {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        panic!("scripted launcher never reached the expected state: {:?}", self.state.lock());
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, request: &ProcessRequest) -> Result<ProcessHandle, LaunchError> {
        let mut state = self.state.lock();
        let script = state.scripts.get(&request.program).cloned().unwrap_or_default();
        if script.spawn_error {
            return Err(LaunchError::spawn(
                request.command_line(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            ));
        }

        state.next_pid += 1;
        let pid = state.next_pid;
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        state.live.insert(
            pid,
            LiveProcess {
                program: request.program.clone(),
                working_dir: request.working_dir.clone(),
                outputs: script.outputs.clone(),
                exit: exit_tx,
            },
        );
        state.launched.push(request.clone());
        state.max_live = state.max_live.max(state.live.len());
        drop(state);

        let shared = Arc::clone(&self.state);
        let delay = script.auto_exit.unwrap_or_default();
        let auto_exit = script.auto_exit.is_some();
        let exit_code = script.exit_code;
        tokio::spawn(async move {
            tokio::select! {
                killed = kill_rx => {
                    if killed.is_ok() {
                        shared.lock().exit(pid, KILLED_EXIT_CODE);
                    }
                }
                () = tokio::time::sleep(delay), if auto_exit => {
                    shared.lock().exit(pid, exit_code);
                }
            }
        });

        Ok(ProcessHandle::new(Some(pid), exit_rx, kill_tx))
    }
}

/// [`ProgressSink`] keeping every message
#[derive(Debug, Default)]
pub struct RecordingProgress {
    state: Mutex<ProgressLog>,
}

#[derive(Debug, Default)]
struct ProgressLog {
    pushed: Vec<String>,
    depth: isize,
    listed: Vec<String>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().pushed.clone()
    }

    /// Pushes minus pops
    pub fn depth(&self) -> isize {
        self.state.lock().depth
    }

    pub fn listed(&self) -> Vec<String> {
        self.state.lock().listed.clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn push_status(&self, status: &str) {
        let mut log = self.state.lock();
        log.pushed.push(status.to_string());
        log.depth += 1;
    }

    fn pop_status(&self) {
        self.state.lock().depth -= 1;
    }

    fn set_sub_task(&self, _task: &str) {}

    fn list(&self, message: &str) {
        self.state.lock().listed.push(message.to_string());
    }
}

/// [`LocalFileSystem`] that remembers which files were written through it
#[derive(Debug, Default)]
pub struct RecordingFileSystem {
    written: Mutex<Vec<PathBuf>>,
}

impl RecordingFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files written so far, in write order
    pub fn written(&self) -> Vec<PathBuf> {
        self.written.lock().clone()
    }

    pub fn was_written(&self, path: &Path) -> bool {
        self.written.lock().iter().any(|p| p == path)
    }
}

impl FileSystem for RecordingFileSystem {
    fn list_files(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        LocalFileSystem.list_files(root)
    }

    fn is_file(&self, path: &Path) -> bool {
        LocalFileSystem.is_file(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        LocalFileSystem.is_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        LocalFileSystem.create_dir_all(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        LocalFileSystem.read_to_string(path)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        LocalFileSystem.write_file(path, contents)?;
        self.written.lock().push(path.to_path_buf());
        Ok(())
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        LocalFileSystem.copy_file(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        LocalFileSystem.remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        LocalFileSystem.remove_dir_all(path)
    }

    fn prune_empty_dirs(&self, root: &Path) -> io::Result<usize> {
        LocalFileSystem.prune_empty_dirs(root)
    }

    fn remove_dir_if_empty(&self, path: &Path) -> io::Result<bool> {
        LocalFileSystem.remove_dir_if_empty(path)
    }
}

/// Part with the default reduced-matrix layout and `rosettes` strain gages
pub fn part(name: &str, base_id: i64, rosettes: usize) -> PartInfo {
    let mut part = PartInfo::new(name, base_id);
    part.rosettes = (1..=rosettes).map(|i| format!("rosette {i}")).collect();
    part
}

/// Temporary model directory with an archive manager and a process group
/// manager on top of a [`ScriptedLauncher`]
pub struct Harness {
    pub dir: TempDir,
    pub launcher: ScriptedLauncher,
    pub progress: Arc<RecordingProgress>,
    pub fs: Arc<RecordingFileSystem>,
    pub archives: Arc<ResultArchiveManager>,
    pub manager: ProcessGroupManager,
    pub events: broadcast::Receiver<StageEvent>,
}

impl Harness {
    /// Build a harness; the model directory is the temporary directory
    pub fn new(model: StaticModel, config: RecoveryConfig, launcher: ScriptedLauncher) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let model = StaticModel {
            model_dir: dir.path().to_path_buf(),
            ..model
        };
        let config = RecoveryConfig {
            archive: ArchiveConfig::default().with_rdb_root(dir.path().join("model_RDB")),
            retry_delay_ms: 10,
            ..config
        };

        let fs = Arc::new(RecordingFileSystem::new());
        let shared_fs: Arc<dyn FileSystem> = fs.clone();
        let archives = Arc::new(ResultArchiveManager::new(
            config.archive.clone(),
            Arc::clone(&shared_fs),
        ));
        let progress = Arc::new(RecordingProgress::new());
        let manager = ProcessGroupManager::new(
            config,
            Arc::new(launcher.clone()),
            Arc::clone(&archives),
            Arc::new(model),
            progress.clone(),
            shared_fs,
        );
        let events = manager.subscribe();
        Self {
            dir,
            launcher,
            progress,
            fs,
            archives,
            manager,
            events,
        }
    }

    pub fn model_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn add_event(&self, id: u32, probability: f64) -> ScenarioId {
        let scenario = ScenarioId::Event(id);
        self.archives.add_scenario(scenario, probability).unwrap();
        scenario
    }

    /// Drain events received so far
    pub fn drain_events(&mut self) -> Vec<StageEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the next terminal event of a ticket
    pub async fn terminal_event(&mut self, ticket: rcy_core::StageTicket) -> StageEvent {
        let wait = async {
            loop {
                let event = self.events.recv().await.unwrap();
                if event.ticket() == ticket && event.is_terminal() {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait).await.unwrap()
    }
}
