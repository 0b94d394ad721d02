//! Process group manager
//!
//! Schedules recovery stages and supervises their solver processes:
//! - FIFO queue bounded by `max_concurrent_processes` live processes
//! - Dependency waits re-checked on a timer, never by blocking
//! - One exit watcher task per live process
//! - Per-scenario kill that leaves other scenarios alone
//! - Duplicate submissions (same stage key) dropped
//!
//! All scheduling state sits behind one `parking_lot::Mutex`. Exit watchers
//! and retry timers are tokio tasks that re-enter through it; the lock is
//! never held across an await point. The archive scan after a process exit
//! runs on the blocking pool, outside the lock.

use crate::batch::RecoveryBatch;
use crate::config::RecoveryConfig;
use crate::error::RecoveryError;
use crate::launcher::{KillSwitch, ProcessLauncher, UNKNOWN_EXIT_CODE};
use crate::model::ModelProvider;
use crate::progress::ProgressSink;
use crate::stage::{RecoveryStage, RunningGroups, StageContext, StartStatus};
use crate::types::{StageKey, StageKind, StageStatus, StageTicket};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcy_archive::{FileSystem, ResultArchive, ResultArchiveManager, ScenarioId};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notification of a submitted stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    /// Accepted into the queue
    Queued {
        /// Submission ticket
        ticket: StageTicket,
        /// Stage identity
        key: StageKey,
    },
    /// Waiting for a producing stage; re-checked after the retry delay
    Waiting {
        /// Submission ticket
        ticket: StageTicket,
        /// Stage identity
        key: StageKey,
        /// Number of checks so far
        attempt: u32,
    },
    /// Solver process launched
    Started {
        /// Submission ticket
        ticket: StageTicket,
        /// Stage identity
        key: StageKey,
        /// OS process id, if known
        pid: Option<u32>,
    },
    /// Solver process exited; a non-zero code still completes the stage
    Finished {
        /// Submission ticket
        ticket: StageTicket,
        /// Stage identity
        key: StageKey,
        /// Exit code
        exit_code: i32,
    },
    /// Stage can never run as requested
    Failed {
        /// Submission ticket
        ticket: StageTicket,
        /// Stage identity
        key: StageKey,
        /// Cause, naming the missing prerequisite
        reason: String,
    },
    /// Nothing to do, or an identical stage is already scheduled
    Skipped {
        /// Submission ticket
        ticket: StageTicket,
        /// Stage identity
        key: StageKey,
        /// Why the stage was skipped
        reason: String,
    },
    /// Discarded or terminated by [`ProcessGroupManager::kill_all`]
    Cancelled {
        /// Submission ticket
        ticket: StageTicket,
        /// Stage identity
        key: StageKey,
    },
}

impl StageEvent {
    /// Ticket the event concerns
    #[must_use]
    pub fn ticket(&self) -> StageTicket {
        match self {
            Self::Queued { ticket, .. }
            | Self::Waiting { ticket, .. }
            | Self::Started { ticket, .. }
            | Self::Finished { ticket, .. }
            | Self::Failed { ticket, .. }
            | Self::Skipped { ticket, .. }
            | Self::Cancelled { ticket, .. } => *ticket,
        }
    }

    /// Stage the event concerns
    #[must_use]
    pub fn key(&self) -> &StageKey {
        match self {
            Self::Queued { key, .. }
            | Self::Waiting { key, .. }
            | Self::Started { key, .. }
            | Self::Finished { key, .. }
            | Self::Failed { key, .. }
            | Self::Skipped { key, .. }
            | Self::Cancelled { key, .. } => key,
        }
    }

    /// Check if no further event follows for the ticket
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Failed { .. } | Self::Skipped { .. } | Self::Cancelled { .. }
        )
    }
}

/// Which stages [`ProcessGroupManager::kill_all`] reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillScope {
    /// Stages of one scenario
    Scenario(ScenarioId),
    /// Every stage
    All,
}

impl KillScope {
    #[inline]
    fn contains(self, scenario: ScenarioId) -> bool {
        match self {
            Self::Scenario(id) => id == scenario,
            Self::All => true,
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Stages waiting for a free process slot
    pub queued: usize,
    /// Stages waiting for a producing stage
    pub waiting: usize,
    /// Live processes, including killed ones not yet reaped
    pub running: usize,
    /// Processes started since creation
    pub total_started: usize,
    /// Processes reaped since creation
    pub total_finished: usize,
}

#[derive(Debug)]
struct PendingStage {
    ticket: StageTicket,
    stage: Box<dyn RecoveryStage>,
    attempts: u32,
}

#[derive(Debug)]
struct RunningStage {
    stage: Box<dyn RecoveryStage>,
    run_dir: PathBuf,
    kill: KillSwitch,
    started_at: DateTime<Utc>,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: VecDeque<PendingStage>,
    waiting: HashMap<StageTicket, (PendingStage, u64)>,
    running: HashMap<StageTicket, RunningStage>,
    generations: HashMap<ScenarioId, u64>,
    global_generation: u64,
    total_started: usize,
    total_finished: usize,
}

impl SchedulerState {
    fn generation(&self, scenario: ScenarioId) -> u64 {
        self.global_generation + self.generations.get(&scenario).copied().unwrap_or(0)
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.waiting.is_empty() && self.running.is_empty()
    }

    fn live(&self) -> impl Iterator<Item = &RunningStage> {
        self.running.values().filter(|run| !run.cancelled)
    }

    fn running_groups(&self) -> RunningGroups {
        self.live()
            .map(|run| (run.stage.key().scenario, run.stage.key().kind))
            .collect()
    }

    /// Killed processes count until reaped, since they may still write
    /// into the run directory a new submission would reuse
    fn is_scheduled(&self, key: &StageKey) -> bool {
        self.queue.iter().any(|p| p.stage.key() == key)
            || self.waiting.values().any(|(p, _)| p.stage.key() == key)
            || self.running.values().any(|run| run.stage.key() == key)
    }
}

struct Shared {
    config: RecoveryConfig,
    launcher: Arc<dyn ProcessLauncher>,
    archives: Arc<ResultArchiveManager>,
    model: Arc<dyn ModelProvider>,
    progress: Arc<dyn ProgressSink>,
    fs: Arc<dyn FileSystem>,
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<StageEvent>,
    idle: Notify,
}

/// Schedules recovery stages and supervises their processes
///
/// Cloning yields another handle to the same scheduler. `submit`,
/// `submit_batch` and `kill_all` must be called from within a tokio runtime.
#[derive(Clone)]
pub struct ProcessGroupManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProcessGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroupManager")
            .field("max_concurrent_processes", &self.shared.config.max_concurrent_processes)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ProcessGroupManager {
    /// Create a manager
    #[must_use]
    pub fn new(
        config: RecoveryConfig,
        launcher: Arc<dyn ProcessLauncher>,
        archives: Arc<ResultArchiveManager>,
        model: Arc<dyn ModelProvider>,
        progress: Arc<dyn ProgressSink>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                launcher,
                archives,
                model,
                progress,
                fs,
                state: Mutex::new(SchedulerState::default()),
                events,
                idle: Notify::new(),
            }),
        }
    }

    /// Subscribe to stage events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.shared.events.subscribe()
    }

    /// Orchestration settings
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RecoveryConfig {
        &self.shared.config
    }

    /// Archive manager the stages write through
    #[inline]
    #[must_use]
    pub fn archives(&self) -> &Arc<ResultArchiveManager> {
        &self.shared.archives
    }

    /// Submit one stage
    ///
    /// The stage's dependencies are checked right away when a process slot
    /// is free. A stage whose key is already queued, waiting or running
    /// (killed but not yet reaped included) is dropped with a
    /// [`StageEvent::Skipped`].
    pub fn submit(&self, stage: Box<dyn RecoveryStage>) -> StageTicket {
        let shared = &self.shared;
        let ticket = StageTicket::new();
        let key = stage.key().clone();
        let mut state = shared.state.lock();

        if state.is_scheduled(&key) {
            debug!(%key, "Dropping duplicate stage");
            shared.emit(StageEvent::Skipped {
                ticket,
                key,
                reason: "an identical stage is already scheduled".to_string(),
            });
            return ticket;
        }
        if let Err(e) = shared.archives.mark_touched(key.scenario) {
            shared.fail(ticket, &key, e.to_string());
            shared.settle(&state);
            return ticket;
        }

        shared.emit(StageEvent::Queued {
            ticket,
            key,
        });
        state.queue.push_back(PendingStage {
            ticket,
            stage,
            attempts: 0,
        });
        shared.pump(&mut state);
        ticket
    }

    /// Submit several stages at once
    ///
    /// # Errors
    /// Returns [`RecoveryError::SharedOutputConflict`] when several parts
    /// would export into one file while processes run concurrently. Nothing
    /// of the batch is started then, and pending work of its scenarios is
    /// discarded.
    pub fn submit_batch(&self, batch: RecoveryBatch) -> Result<Vec<StageTicket>, RecoveryError> {
        if let Some((output, parts)) = batch.shared_output() {
            if self.shared.config.max_concurrent_processes > 1 {
                error!(
                    "===> {parts} FE parts cannot export into {} concurrently. \
                     Set the maximum number of concurrent processes to 1.",
                    output.display()
                );
                for scenario in batch.scenarios() {
                    self.kill_all(KillScope::Scenario(scenario), false);
                }
                return Err(RecoveryError::SharedOutputConflict { parts, output });
            }
        }
        Ok(batch
            .into_stages()
            .into_iter()
            .map(|stage| self.submit(stage))
            .collect())
    }

    /// Discard pending stages in scope
    ///
    /// With `cascade_dependents`, live processes in scope are terminated as
    /// well; their late exit notifications only free the process slot.
    ///
    /// # Returns
    /// Number of stages cancelled.
    pub fn kill_all(&self, scope: KillScope, cascade_dependents: bool) -> usize {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        match scope {
            KillScope::Scenario(id) => *state.generations.entry(id).or_default() += 1,
            KillScope::All => state.global_generation += 1,
        }

        let mut cancelled = Vec::new();
        let queue = std::mem::take(&mut state.queue);
        for pending in queue {
            if scope.contains(pending.stage.key().scenario) {
                cancelled.push((pending.ticket, pending.stage.key().clone()));
            } else {
                state.queue.push_back(pending);
            }
        }
        let waiting: Vec<StageTicket> = state
            .waiting
            .iter()
            .filter(|(_, (p, _))| scope.contains(p.stage.key().scenario))
            .map(|(ticket, _)| *ticket)
            .collect();
        for ticket in waiting {
            if let Some((pending, _)) = state.waiting.remove(&ticket) {
                cancelled.push((ticket, pending.stage.key().clone()));
            }
        }

        if cascade_dependents {
            for (ticket, run) in &mut state.running {
                if run.cancelled || !scope.contains(run.stage.key().scenario) {
                    continue;
                }
                run.cancelled = true;
                if !run.kill.kill() {
                    debug!(key = %run.stage.key(), "Process already gone");
                }
                run.stage.on_cancelled(shared.progress.as_ref());
                cancelled.push((*ticket, run.stage.key().clone()));
            }
        }

        for (ticket, key) in &cancelled {
            shared.emit(StageEvent::Cancelled {
                ticket: *ticket,
                key: key.clone(),
            });
        }
        if !cancelled.is_empty() {
            info!(?scope, count = cancelled.len(), "Recovery stages cancelled");
        }
        shared.settle(&state);
        cancelled.len()
    }

    /// Check if a stage of `kind` runs for `scenario`
    #[must_use]
    pub fn is_group_running(&self, kind: StageKind, scenario: ScenarioId) -> bool {
        self.shared
            .state
            .lock()
            .live()
            .any(|run| run.stage.key().kind == kind && run.stage.key().scenario == scenario)
    }

    /// Check if any process runs for `scenario`
    #[must_use]
    pub fn is_scenario_running(&self, scenario: ScenarioId) -> bool {
        self.shared
            .state
            .lock()
            .live()
            .any(|run| run.stage.key().scenario == scenario)
    }

    /// Number of live processes, including killed ones not yet reaped
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    /// Run directories of live processes, with their start time
    #[must_use]
    pub fn running(&self) -> Vec<(StageKey, PathBuf, DateTime<Utc>)> {
        self.shared
            .state
            .lock()
            .live()
            .map(|run| (run.stage.key().clone(), run.run_dir.clone(), run.started_at))
            .collect()
    }

    /// Scheduler statistics
    #[must_use]
    pub fn stats(&self) -> GroupStats {
        let state = self.shared.state.lock();
        GroupStats {
            queued: state.queue.len(),
            waiting: state.waiting.len(),
            running: state.running.len(),
            total_started: state.total_started,
            total_finished: state.total_finished,
        }
    }

    /// Check if nothing is queued, waiting or running
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().is_idle()
    }

    /// Resolve once nothing is queued, waiting or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Shared {
    fn emit(&self, event: StageEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn settle(&self, state: &SchedulerState) {
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn fail(&self, ticket: StageTicket, key: &StageKey, reason: String) {
        error!("===> {key}: {reason}");
        self.emit(StageEvent::Failed {
            ticket,
            key: key.clone(),
            reason,
        });
    }

    fn context<'a>(&'a self, archive: &'a ResultArchive, running: &'a RunningGroups) -> StageContext<'a> {
        StageContext {
            archive,
            archives: &self.archives,
            running,
            model: self.model.as_ref(),
            config: &self.config,
            progress: self.progress.as_ref(),
            fs: self.fs.as_ref(),
        }
    }

    /// Start queued stages while process slots are free
    fn pump(self: &Arc<Self>, state: &mut SchedulerState) {
        let max = self.config.max_concurrent_processes.max(1);
        while state.running.len() < max {
            let Some(pending) = state.queue.pop_front() else {
                break;
            };
            self.evaluate(state, pending);
        }
        self.settle(state);
    }

    fn evaluate(self: &Arc<Self>, state: &mut SchedulerState, mut pending: PendingStage) {
        let key = pending.stage.key().clone();
        let ticket = pending.ticket;
        let archive = match self.archives.snapshot(key.scenario) {
            Ok(archive) => archive,
            Err(e) => return self.fail(ticket, &key, e.to_string()),
        };
        let running = state.running_groups();
        let ctx = self.context(&archive, &running);

        match pending.stage.check_dependencies(&ctx) {
            StageStatus::ReadyToRun => {}
            StageStatus::PendingButWait => return self.defer(state, pending),
            StageStatus::NotExecutable(reason) => return self.fail(ticket, &key, reason),
            StageStatus::ResultsOk => {
                return self.emit(StageEvent::Skipped {
                    ticket,
                    key,
                    reason: "no results to recover".to_string(),
                })
            }
        }

        let report = pending.stage.create_input(&ctx);
        let run_dir = match (report.status, report.run_dir) {
            (StageStatus::ReadyToRun, Some(run_dir)) => run_dir,
            (StageStatus::PendingButWait, _) => return self.defer(state, pending),
            (StageStatus::ResultsOk, _) => {
                return self.emit(StageEvent::Skipped {
                    ticket,
                    key,
                    reason: "no results to recover".to_string(),
                })
            }
            (StageStatus::NotExecutable(reason), _) => return self.fail(ticket, &key, reason),
            (StageStatus::ReadyToRun, None) => {
                return self.fail(ticket, &key, "no run directory".to_string())
            }
        };

        match pending.stage.start_process(&run_dir, &ctx, self.launcher.as_ref()) {
            StartStatus::Started(handle) => {
                let pid = handle.pid();
                let (exit, kill) = handle.into_parts();
                state.running.insert(
                    ticket,
                    RunningStage {
                        stage: pending.stage,
                        run_dir,
                        kill,
                        started_at: Utc::now(),
                        cancelled: false,
                    },
                );
                state.total_started += 1;
                debug!(%key, ?pid, live = state.running.len(), "Process started");
                self.emit(StageEvent::Started { ticket, key, pid });

                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let exit_code = exit.await.unwrap_or(UNKNOWN_EXIT_CODE);
                    shared.on_exit(ticket, exit_code).await;
                });
            }
            StartStatus::NotExecutable(reason) => self.fail(ticket, &key, reason),
        }
    }

    /// Park a stage whose producer still runs, or give up on it
    fn defer(self: &Arc<Self>, state: &mut SchedulerState, mut pending: PendingStage) {
        pending.attempts += 1;
        let key = pending.stage.key().clone();
        let scenario = key.scenario;

        let exhausted = match self.config.max_dependency_retries {
            Some(max) => pending.attempts > max,
            None => !state.live().any(|run| run.stage.key().scenario == scenario),
        };
        if exhausted {
            let producer = key.kind.producer().map_or("its producer", StageKind::label);
            return self.fail(
                pending.ticket,
                &key,
                format!(
                    "gave up waiting for {producer} after {} checks",
                    pending.attempts
                ),
            );
        }

        if pending.attempts == self.config.warn_after_retries {
            warn!(%key, attempts = pending.attempts, "Still waiting for input from a running stage");
        } else {
            debug!(%key, attempts = pending.attempts, "Waiting for input from a running stage");
        }
        self.emit(StageEvent::Waiting {
            ticket: pending.ticket,
            key,
            attempt: pending.attempts,
        });

        let ticket = pending.ticket;
        let generation = state.generation(scenario);
        state.waiting.insert(ticket, (pending, generation));

        let shared = Arc::clone(self);
        let delay = self.config.retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.resume(ticket);
        });
    }

    /// Re-queue a waiting stage at the front, unless it was killed meanwhile
    fn resume(self: &Arc<Self>, ticket: StageTicket) {
        let mut state = self.state.lock();
        let Some((pending, generation)) = state.waiting.remove(&ticket) else {
            return;
        };
        let key = pending.stage.key().clone();
        if generation != state.generation(key.scenario) {
            debug!(%key, "Dropping stage from a killed generation");
            self.emit(StageEvent::Cancelled { ticket, key });
            self.settle(&state);
            return;
        }
        state.queue.push_front(pending);
        self.pump(&mut state);
    }

    /// Sync the archive of an exited process, then reap it
    ///
    /// The process keeps its slot while the archive is scanned.
    async fn on_exit(self: &Arc<Self>, ticket: StageTicket, exit_code: i32) {
        let scenario = {
            let state = self.state.lock();
            match state.running.get(&ticket) {
                Some(run) if run.cancelled => None,
                Some(run) => Some(run.stage.key().scenario),
                None => return,
            }
        };
        if let Some(scenario) = scenario {
            let archives = Arc::clone(&self.archives);
            match tokio::task::spawn_blocking(move || archives.sync(scenario)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(%scenario, error = %e, "Could not sync result archive"),
                Err(e) => warn!(%scenario, error = %e, "Result archive sync did not complete"),
            }
        }
        self.reap(ticket, exit_code);
    }

    /// Report an exited process and hand its slot to the queue
    fn reap(self: &Arc<Self>, ticket: StageTicket, exit_code: i32) {
        let mut state = self.state.lock();
        let Some(mut run) = state.running.remove(&ticket) else {
            return;
        };
        state.total_finished += 1;
        let key = run.stage.key().clone();

        if run.cancelled {
            debug!(%key, exit_code, "Killed process reaped");
        } else {
            match self.archives.snapshot(key.scenario) {
                Ok(archive) => {
                    let running = state.running_groups();
                    let ctx = self.context(&archive, &running);
                    run.stage.on_process_death(exit_code, &ctx);
                }
                Err(e) => warn!(%key, error = %e, "Scenario vanished while its process ran"),
            }
            self.emit(StageEvent::Finished {
                ticket,
                key,
                exit_code,
            });
        }
        self.pump(&mut state);
    }
}
