//! Result archive manager
//!
//! Owns the archive of the master scenario and of every event, and is the
//! only writer of them. Each scenario keeps two archives:
//! - `current`, what has been recorded this session
//! - `committed`, the baseline as of the last save (or of first activation)
//!
//! Closing reverts `current` to `committed` and deletes what was written in
//! between. Exactly one scenario is active; the model extractor follows it.
//!
//! A scenario's archive is read from disk the first time anything needs it.
//! Save, close and increment leave scenarios the session never loaded
//! alone. Every commit is recorded in a [`CommittedManifest`], and loading
//! starts from that record, so versions written after the last save are
//! uncommitted even when the session that wrote them crashed.

use crate::archive::{task_versions, ResultArchive, SyncReport, DEFAULT_TASK_NAME};
use crate::error::{ArchiveError, Result};
use crate::extractor::{ExtractorEvent, ResultExtractorManager, ResultsFlag};
use crate::fs::FileSystem;
use crate::manifest::CommittedManifest;
use crate::path::{versioned_dir_name, TaskPath};
use crate::scenario::{Scenario, ScenarioId};
use crate::state::{validate_transition, ArchiveState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the archive event bus
const EVENT_CAPACITY: usize = 256;

/// File category read by the model extractor
const RESULT_CATEGORY: &str = "frs";

/// Archive location and naming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding the master task directories and `event_NNN` dirs
    pub rdb_root: PathBuf,
    /// Name of the root task
    pub task_name: String,
    /// Template files read by the possibility extractor
    pub template_files: Vec<PathBuf>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            rdb_root: PathBuf::from("model_RDB"),
            task_name: DEFAULT_TASK_NAME.to_string(),
            template_files: Vec::new(),
        }
    }
}

impl ArchiveConfig {
    /// Set the archive root
    #[inline]
    #[must_use]
    pub fn with_rdb_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.rdb_root = root.into();
        self
    }

    /// Set the root task name
    #[inline]
    #[must_use]
    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = name.into();
        self
    }

    /// Set the template files
    #[inline]
    #[must_use]
    pub fn with_template_files(mut self, files: Vec<PathBuf>) -> Self {
        self.template_files = files;
        self
    }
}

/// Notifications about archive mutations, delivered in mutation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEvent {
    /// A run directory was created for a stage
    SubTaskCreated {
        /// Scenario concerned
        scenario: ScenarioId,
        /// Directory created
        dir: PathBuf,
    },
    /// The archive was reconciled with the disk
    Synced {
        /// Scenario concerned
        scenario: ScenarioId,
        /// Files discovered
        added: usize,
        /// Files gone
        removed: usize,
    },
    /// The archive was committed
    Saved {
        /// Scenario concerned
        scenario: ScenarioId,
    },
    /// The archive was moved to a new root
    Relocated {
        /// Scenario concerned
        scenario: ScenarioId,
        /// New root directory
        root: PathBuf,
    },
    /// The task version was bumped
    Incremented {
        /// Scenario concerned
        scenario: ScenarioId,
        /// New task version
        version: u32,
    },
    /// Uncommitted results were discarded
    Closed {
        /// Scenario concerned
        scenario: ScenarioId,
    },
    /// The active scenario changed
    Activated {
        /// Newly active scenario
        scenario: ScenarioId,
    },
}

/// Files of one scenario with its probability weight
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedFiles {
    /// Scenario the files belong to
    pub scenario: ScenarioId,
    /// Probability weight of the scenario
    pub probability: f64,
    /// Absolute file paths
    pub files: Vec<PathBuf>,
}

#[derive(Debug)]
struct Slot {
    scenario: Scenario,
    current: ResultArchive,
    committed: ResultArchive,
    state: ArchiveState,
    loaded: bool,
}

impl Slot {
    fn new(scenario: Scenario, root: PathBuf, task_name: &str) -> Self {
        let archive = ResultArchive::new(root, task_name);
        Self {
            scenario,
            current: archive.clone(),
            committed: archive,
            state: ArchiveState::Empty,
            loaded: false,
        }
    }

    fn transition(&mut self, to: ArchiveState) -> Result<()> {
        validate_transition(self.state, to)?;
        self.state = to;
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    rdb_root: PathBuf,
    slots: BTreeMap<ScenarioId, Slot>,
    active: ScenarioId,
    extractors: ResultExtractorManager,
}

/// Owner of every scenario's result archive
#[derive(Debug)]
pub struct ResultArchiveManager {
    task_name: String,
    fs: Arc<dyn FileSystem>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ArchiveEvent>,
}

impl ResultArchiveManager {
    /// Create a manager holding an empty master archive
    ///
    /// Nothing is read from disk; call [`ResultArchiveManager::open`] to load
    /// existing results.
    #[must_use]
    pub fn new(config: ArchiveConfig, fs: Arc<dyn FileSystem>) -> Self {
        let master = Slot::new(
            Scenario::new(ScenarioId::Master, 1.0),
            config.rdb_root.clone(),
            &config.task_name,
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            task_name: config.task_name,
            fs,
            inner: Mutex::new(Inner {
                rdb_root: config.rdb_root,
                slots: BTreeMap::from([(ScenarioId::Master, master)]),
                active: ScenarioId::Master,
                extractors: ResultExtractorManager::new(config.template_files),
            }),
            events,
        }
    }

    /// Subscribe to archive events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.events.subscribe()
    }

    /// Subscribe to extractor events
    #[must_use]
    pub fn subscribe_extractors(&self) -> broadcast::Receiver<ExtractorEvent> {
        self.inner.lock().extractors.subscribe()
    }

    /// Shared "new results exist" flag
    #[must_use]
    pub fn results_flag(&self) -> ResultsFlag {
        self.inner.lock().extractors.results_flag()
    }

    /// Run a closure against the extractors
    pub fn with_extractors<R>(&self, f: impl FnOnce(&ResultExtractorManager) -> R) -> R {
        f(&self.inner.lock().extractors)
    }

    /// Poll the extractors for grown files
    pub fn poll_extractors(&self) -> usize {
        self.inner.lock().extractors.poll()
    }

    /// Current archive root
    #[must_use]
    pub fn rdb_root(&self) -> PathBuf {
        self.inner.lock().rdb_root.clone()
    }

    /// Root task name
    #[inline]
    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Directory holding a scenario's task directories
    #[must_use]
    pub fn scenario_root(&self, id: ScenarioId) -> PathBuf {
        scenario_root(&self.inner.lock().rdb_root, id)
    }

    /// Register an event scenario with an empty archive
    ///
    /// # Errors
    /// Returns [`ArchiveError::DuplicateScenario`] if the id is taken.
    pub fn add_scenario(&self, id: ScenarioId, probability: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.slots.contains_key(&id) {
            return Err(ArchiveError::DuplicateScenario(id));
        }
        let root = scenario_root(&inner.rdb_root, id);
        inner
            .slots
            .insert(id, Slot::new(Scenario::new(id, probability), root, &self.task_name));
        debug!(scenario = %id, probability, "Scenario added");
        Ok(())
    }

    /// Forget an event scenario; its files stay on disk
    ///
    /// The master scenario becomes active if the removed one was.
    ///
    /// # Errors
    /// Returns an error for the master scenario or an unknown id.
    pub fn remove_scenario(&self, id: ScenarioId) -> Result<()> {
        if id.is_master() {
            return Err(ArchiveError::MasterNotRemovable);
        }
        let mut inner = self.inner.lock();
        if inner.slots.remove(&id).is_none() {
            return Err(ArchiveError::UnknownScenario(id));
        }
        if inner.active == id {
            inner.active = ScenarioId::Master;
            inner.extractors.renew(&BTreeSet::new());
            self.emit(ArchiveEvent::Activated {
                scenario: ScenarioId::Master,
            });
        }
        Ok(())
    }

    /// All scenarios, master first
    #[must_use]
    pub fn scenarios(&self) -> Vec<Scenario> {
        self.inner
            .lock()
            .slots
            .values()
            .map(|slot| slot.scenario.clone())
            .collect()
    }

    /// Currently active scenario
    #[must_use]
    pub fn active(&self) -> ScenarioId {
        self.inner.lock().active
    }

    /// Copy of a scenario's current archive, read from disk on first use
    ///
    /// # Errors
    /// Returns [`ArchiveError::UnknownScenario`] for unknown ids, or the
    /// error of reading the archive.
    pub fn snapshot(&self, id: ScenarioId) -> Result<ResultArchive> {
        let mut inner = self.inner.lock();
        let Inner {
            slots,
            active,
            extractors,
            ..
        } = &mut *inner;
        let slot = slot_mut(slots, id)?;
        self.ensure_loaded(id, slot, *active == id, extractors)?;
        Ok(slot.current.clone())
    }

    /// Copy of a scenario's committed baseline
    ///
    /// # Errors
    /// Returns [`ArchiveError::UnknownScenario`] for unknown ids.
    pub fn committed(&self, id: ScenarioId) -> Result<ResultArchive> {
        let inner = self.inner.lock();
        Ok(slot(&inner.slots, id)?.committed.clone())
    }

    /// Lifecycle state of a scenario's archive
    ///
    /// # Errors
    /// Returns [`ArchiveError::UnknownScenario`] for unknown ids.
    pub fn state(&self, id: ScenarioId) -> Result<ArchiveState> {
        let inner = self.inner.lock();
        Ok(slot(&inner.slots, id)?.state)
    }

    /// Mark a scenario as used this session
    ///
    /// # Errors
    /// Returns [`ArchiveError::UnknownScenario`] for unknown ids.
    pub fn mark_touched(&self, id: ScenarioId) -> Result<()> {
        let mut inner = self.inner.lock();
        slot_mut(&mut inner.slots, id)?.scenario.touched = true;
        Ok(())
    }

    /// Rebuild a scenario's archive from disk
    ///
    /// The committed record decides the task version and the files; without
    /// one, the highest task version on disk is taken as is. The result
    /// becomes both current and committed.
    ///
    /// # Errors
    /// Returns an error if the scenario is unknown, listing fails or the
    /// committed record is unreadable.
    pub fn open(&self, id: ScenarioId) -> Result<ResultArchive> {
        let mut inner = self.inner.lock();
        let Inner {
            slots,
            active,
            extractors,
            ..
        } = &mut *inner;
        let slot = slot_mut(slots, id)?;
        self.load(id, slot)?;
        let archive = slot.current.clone();
        slot.transition(ArchiveState::Synced)?;

        if *active == id {
            let keep = archive
                .files_of_category(RESULT_CATEGORY)
                .into_iter()
                .collect::<BTreeSet<_>>();
            extractors.renew(&keep);
        }
        info!(
            scenario = %id,
            version = archive.version(),
            files = archive.root().file_count(),
            "Result archive opened"
        );
        Ok(archive)
    }

    /// Get or create a sub-task and its directory on disk
    ///
    /// Moves the archive to `Populating` and marks the scenario touched.
    ///
    /// # Errors
    /// Returns an error if the scenario is unknown or the directory cannot be
    /// created.
    pub fn ensure_sub_task_dir(&self, id: ScenarioId, path: &TaskPath) -> Result<PathBuf> {
        let mut inner = self.inner.lock();
        let Inner {
            slots,
            active,
            extractors,
            ..
        } = &mut *inner;
        let slot = slot_mut(slots, id)?;
        self.ensure_loaded(id, slot, *active == id, extractors)?;
        let dir = slot.current.add_sub_task(path);
        self.fs
            .create_dir_all(&dir)
            .map_err(|e| ArchiveError::io(&dir, e))?;
        slot.scenario.touched = true;
        slot.transition(ArchiveState::Populating)?;
        self.emit(ArchiveEvent::SubTaskCreated {
            scenario: id,
            dir: dir.clone(),
        });
        Ok(dir)
    }

    /// Reconcile a scenario's archive with the disk
    ///
    /// New result files of the active scenario are handed to the model
    /// extractor.
    ///
    /// # Errors
    /// Returns an error if the scenario is unknown or listing fails.
    pub fn sync(&self, id: ScenarioId) -> Result<SyncReport> {
        let mut inner = self.inner.lock();
        let Inner {
            slots,
            active,
            extractors,
            ..
        } = &mut *inner;
        let slot = slot_mut(slots, id)?;
        self.ensure_loaded(id, slot, *active == id, extractors)?;
        let listing = list(self.fs.as_ref(), slot.current.root_path())?;
        let report = slot.current.sync(&listing);
        slot.transition(ArchiveState::Synced)?;

        if *active == id {
            let results = report
                .added
                .iter()
                .filter(|p| p.extension().is_some_and(|ext| ext == RESULT_CATEGORY))
                .cloned()
                .collect::<Vec<_>>();
            if !results.is_empty() {
                extractors.add_model_files(results);
            }
        }

        debug!(
            scenario = %id,
            added = report.added.len(),
            removed = report.removed.len(),
            "Result archive synced"
        );
        self.emit(ArchiveEvent::Synced {
            scenario: id,
            added: report.added.len(),
            removed: report.removed.len(),
        });
        Ok(report)
    }

    /// Commit every scenario's current archive as its baseline
    ///
    /// Deletes task directories of other versions and files of superseded
    /// sub-task versions, then records what was committed. Closed archives
    /// and archives never loaded this session are left alone.
    ///
    /// # Errors
    /// Returns the first filesystem error encountered.
    pub fn save(&self, prune_empty_dirs: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in ordered_ids(&inner.slots) {
            let slot = slot_mut(&mut inner.slots, id)?;
            if !slot.loaded {
                debug!(scenario = %id, "Skipping save of unloaded archive");
                continue;
            }
            if slot.state == ArchiveState::Closed {
                debug!(scenario = %id, "Skipping save of closed archive");
                continue;
            }
            self.commit(slot, prune_empty_dirs)?;
            self.emit(ArchiveEvent::Saved { scenario: id });
        }
        info!(root = %inner.rdb_root.display(), "Results saved");
        Ok(())
    }

    /// Copy every scenario's results to a new root and continue there
    ///
    /// Each archive becomes task version 1 below `new_root` (events in their
    /// `event_NNN` sub-directories). The old location is closed, reverting it
    /// to its last saved state. With `discard_results` the archives are
    /// incremented first, so nothing is carried over. Archives not loaded
    /// yet are read from disk first.
    ///
    /// # Errors
    /// Returns the first filesystem error encountered.
    pub fn save_as(&self, new_root: impl Into<PathBuf>, discard_results: bool) -> Result<()> {
        let new_root = new_root.into();
        let mut inner = self.inner.lock();
        inner.extractors.clear();

        for id in ordered_ids(&inner.slots) {
            let slot = slot_mut(&mut inner.slots, id)?;
            if !slot.loaded {
                self.load(id, slot)?;
            }
            if slot.state == ArchiveState::Closed {
                slot.transition(ArchiveState::Synced)?;
            }
            if discard_results {
                slot.current.increment_version();
            }

            let moved = slot.current.relocated(scenario_root(&new_root, id));
            let from_dir = slot.current.task_dir();
            let to_dir = moved.task_dir();
            for relative in slot.current.relative_files() {
                let from = from_dir.join(&relative);
                let to = to_dir.join(&relative);
                self.fs
                    .copy_file(&from, &to)
                    .map_err(|e| ArchiveError::io(&from, e))?;
            }

            let prune = id.is_master() || !slot.committed.is_empty();
            self.discard_uncommitted(slot, prune)?;
            self.record(&moved)?;

            slot.current = moved.clone();
            slot.committed = moved;
            slot.transition(ArchiveState::Saved)?;
            self.emit(ArchiveEvent::Relocated {
                scenario: id,
                root: scenario_root(&new_root, id),
            });
        }

        info!(
            from = %inner.rdb_root.display(),
            to = %new_root.display(),
            discard_results,
            "Results saved to new location"
        );
        inner.rdb_root = new_root;

        let Inner {
            slots,
            active,
            extractors,
            ..
        } = &mut *inner;
        let keep = slot(slots, *active)?
            .current
            .files_of_category(RESULT_CATEGORY)
            .into_iter()
            .collect::<BTreeSet<_>>();
        extractors.renew(&keep);
        Ok(())
    }

    /// Bump the task version of every non-empty event archive
    ///
    /// Archives not loaded yet are read from disk first. Nothing is deleted;
    /// old files stay until the next save or close. The model extractor is
    /// renewed when the active archive was bumped.
    ///
    /// # Errors
    /// Returns an error on an illegal state transition or if loading fails.
    pub fn increment(&self, touches_master: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner {
            slots,
            active,
            extractors,
            ..
        } = &mut *inner;

        let mut renew = false;
        for (id, slot) in slots.iter_mut() {
            if id.is_master() && !touches_master {
                continue;
            }
            if !slot.loaded {
                self.load(*id, slot)?;
            }
            if slot.current.is_empty() || slot.state == ArchiveState::Closed {
                continue;
            }
            slot.current.increment_version();
            slot.transition(ArchiveState::Incremented)?;
            renew |= *id == *active;
            debug!(scenario = %id, version = slot.current.version(), "Result archive incremented");
            self.emit(ArchiveEvent::Incremented {
                scenario: *id,
                version: slot.current.version(),
            });
        }

        if renew {
            extractors.renew(&BTreeSet::new());
        }
        Ok(())
    }

    /// Discard everything written since the last save
    ///
    /// Releases the extractors first. Then, for every touched scenario and
    /// the master, removes task versions newer than the committed one and,
    /// with `prune_empty_dirs`, files added to the committed task directory.
    /// Archives never loaded this session hold nothing to discard and are
    /// skipped. Calling it twice has the same effect as calling it once.
    ///
    /// # Errors
    /// Returns the first filesystem error encountered.
    pub fn close(&self, prune_empty_dirs: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.extractors.clear();

        for id in ordered_ids(&inner.slots) {
            let slot = slot_mut(&mut inner.slots, id)?;
            if !slot.loaded || (!id.is_master() && !slot.scenario.touched) {
                continue;
            }
            self.discard_uncommitted(slot, prune_empty_dirs)?;
            slot.transition(ArchiveState::Closed)?;
            self.emit(ArchiveEvent::Closed { scenario: id });
        }
        debug!("Result archives closed");
        Ok(())
    }

    /// Make a scenario the active one
    ///
    /// With `close_current_rdb` the extractors are renewed; with `reopen_rdb`
    /// as well, the scenario's archive is read or synced and its results
    /// loaded into the model extractor. The first reopen in a session also
    /// takes the synced archive as the baseline, unless it was just read
    /// from its committed record.
    ///
    /// # Returns
    /// `false` if the scenario was already active; nothing happens then.
    ///
    /// # Errors
    /// Returns an error if the scenario is unknown or listing fails.
    pub fn activate(&self, id: ScenarioId, close_current_rdb: bool, reopen_rdb: bool) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Inner {
            slots,
            active,
            extractors,
            ..
        } = &mut *inner;
        let slot = slot_mut(slots, id)?;
        if *active == id {
            return Ok(false);
        }

        if close_current_rdb {
            extractors.renew(&BTreeSet::new());
        }
        *active = id;

        if close_current_rdb && reopen_rdb {
            if slot.loaded {
                let listing = list(self.fs.as_ref(), slot.current.root_path())?;
                slot.current.sync(&listing);
                if !slot.scenario.touched {
                    slot.committed = slot.current.clone();
                }
            } else {
                self.load(id, slot)?;
            }
            extractors.add_model_files(slot.current.files_of_category(RESULT_CATEGORY));
            slot.transition(ArchiveState::Synced)?;
        }
        slot.scenario.touched = true;

        info!(scenario = %id, "Scenario activated");
        self.emit(ArchiveEvent::Activated { scenario: id });
        Ok(true)
    }

    /// Files of one category per event, with the event's probability
    ///
    /// Without events the master's files are returned with weight 1.
    #[must_use]
    pub fn weighted_files(&self, category: &str) -> Vec<WeightedFiles> {
        let inner = self.inner.lock();
        let weigh = |slot: &Slot| WeightedFiles {
            scenario: slot.scenario.id,
            probability: slot.scenario.probability,
            files: slot.current.files_of_category(category),
        };
        let events = inner
            .slots
            .values()
            .filter(|slot| !slot.scenario.id.is_master())
            .map(weigh)
            .collect::<Vec<_>>();
        if !events.is_empty() {
            return events;
        }
        inner
            .slots
            .get(&ScenarioId::Master)
            .map(weigh)
            .into_iter()
            .collect()
    }

    fn commit(&self, slot: &mut Slot, prune_empty_dirs: bool) -> Result<()> {
        let root = slot.current.root_path().to_path_buf();
        let listing = list(self.fs.as_ref(), &root)?;
        let report = slot.current.sync(&listing);

        let versions = task_versions(&self.task_name, &listing).collect::<BTreeSet<_>>();
        for version in versions {
            if version == slot.current.version() {
                continue;
            }
            let dir = root.join(versioned_dir_name(&self.task_name, version));
            debug!(dir = %dir.display(), "Removing obsolete task version");
            self.fs
                .remove_dir_all(&dir)
                .map_err(|e| ArchiveError::io(&dir, e))?;
        }
        for file in &report.superseded {
            self.fs
                .remove_file(file)
                .map_err(|e| ArchiveError::io(file, e))?;
        }
        if prune_empty_dirs {
            let task_dir = slot.current.task_dir();
            self.fs
                .prune_empty_dirs(&task_dir)
                .map_err(|e| ArchiveError::io(&task_dir, e))?;
        }

        self.record(&slot.current)?;
        slot.committed = slot.current.clone();
        slot.transition(ArchiveState::Saved)
    }

    /// Read a scenario's archive from disk into both current and committed
    fn load(&self, id: ScenarioId, slot: &mut Slot) -> Result<()> {
        let root = slot.current.root_path().to_path_buf();
        let listing = list(self.fs.as_ref(), &root)?;
        let archive = match CommittedManifest::load(self.fs.as_ref(), &root)? {
            Some(manifest) => {
                let unsaved = task_versions(&self.task_name, &listing)
                    .filter(|v| *v > manifest.version)
                    .collect::<BTreeSet<_>>();
                if !unsaved.is_empty() {
                    warn!(
                        scenario = %id,
                        committed = manifest.version,
                        ?unsaved,
                        "Ignoring task versions that were never saved"
                    );
                }
                let entries = manifest.committed_entries(&self.task_name, &listing);
                ResultArchive::open_version(&root, &self.task_name, manifest.version, &entries)
            }
            None => ResultArchive::open(&root, &self.task_name, &listing),
        };
        slot.current = archive.clone();
        slot.committed = archive;
        slot.loaded = true;
        Ok(())
    }

    /// Load a scenario on first use; the active one feeds the model extractor
    fn ensure_loaded(
        &self,
        id: ScenarioId,
        slot: &mut Slot,
        is_active: bool,
        extractors: &mut ResultExtractorManager,
    ) -> Result<()> {
        if slot.loaded {
            return Ok(());
        }
        self.load(id, slot)?;
        let results = slot.current.files_of_category(RESULT_CATEGORY);
        if is_active && !results.is_empty() {
            extractors.add_model_files(results);
        }
        Ok(())
    }

    /// Write the committed record of an archive
    ///
    /// An empty archive whose root does not exist leaves no trace on disk.
    fn record(&self, archive: &ResultArchive) -> Result<()> {
        let root = archive.root_path();
        if archive.is_empty() && !self.fs.is_dir(root) {
            return Ok(());
        }
        CommittedManifest::of(archive).store(self.fs.as_ref(), root)
    }

    fn discard_uncommitted(&self, slot: &mut Slot, prune_empty_dirs: bool) -> Result<()> {
        let root = slot.current.root_path().to_path_buf();
        if !self.fs.is_dir(&root) {
            slot.current = slot.committed.clone();
            return Ok(());
        }

        if prune_empty_dirs {
            let committed_dir = slot.committed.task_dir();
            let keep = slot.committed.relative_files();
            for relative in list(self.fs.as_ref(), &committed_dir)? {
                if keep.contains(&relative) {
                    continue;
                }
                let file = committed_dir.join(&relative);
                self.fs
                    .remove_file(&file)
                    .map_err(|e| ArchiveError::io(&file, e))?;
            }
            self.fs
                .prune_empty_dirs(&committed_dir)
                .map_err(|e| ArchiveError::io(&committed_dir, e))?;
        }

        let listing = list(self.fs.as_ref(), &root)?;
        let committed_version = slot.committed.version();
        let stale = task_versions(&self.task_name, &listing)
            .filter(|v| *v > committed_version)
            .collect::<BTreeSet<_>>();
        for version in stale {
            let dir = root.join(versioned_dir_name(&self.task_name, version));
            debug!(dir = %dir.display(), "Removing uncommitted task version");
            self.fs
                .remove_dir_all(&dir)
                .map_err(|e| ArchiveError::io(&dir, e))?;
        }

        if let Err(e) = self.fs.remove_dir_if_empty(&root) {
            warn!(root = %root.display(), error = %e, "Could not remove empty archive root");
        }
        slot.current = slot.committed.clone();
        Ok(())
    }

    fn emit(&self, event: ArchiveEvent) {
        let _ = self.events.send(event);
    }
}

fn scenario_root(rdb_root: &Path, id: ScenarioId) -> PathBuf {
    match id.dir_name() {
        Some(dir) => rdb_root.join(dir),
        None => rdb_root.to_path_buf(),
    }
}

/// Events before the master, so the master root is emptied last
fn ordered_ids(slots: &BTreeMap<ScenarioId, Slot>) -> Vec<ScenarioId> {
    let mut ids = slots
        .keys()
        .copied()
        .filter(|id| !id.is_master())
        .collect::<Vec<_>>();
    ids.push(ScenarioId::Master);
    ids
}

fn slot(slots: &BTreeMap<ScenarioId, Slot>, id: ScenarioId) -> Result<&Slot> {
    slots.get(&id).ok_or(ArchiveError::UnknownScenario(id))
}

fn slot_mut(slots: &mut BTreeMap<ScenarioId, Slot>, id: ScenarioId) -> Result<&mut Slot> {
    slots.get_mut(&id).ok_or(ArchiveError::UnknownScenario(id))
}

fn list(fs: &dyn FileSystem, root: &Path) -> Result<Vec<PathBuf>> {
    fs.list_files(root).map_err(|e| ArchiveError::io(root, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;

    fn manager(root: &Path) -> ResultArchiveManager {
        ResultArchiveManager::new(
            ArchiveConfig::default().with_rdb_root(root),
            Arc::new(LocalFileSystem),
        )
    }

    #[test]
    fn ensure_sub_task_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let path: TaskPath = "timehist_prim".parse().unwrap();
        let run_dir = manager.ensure_sub_task_dir(ScenarioId::Master, &path).unwrap();
        assert!(run_dir.is_dir());
        assert!(run_dir.ends_with("response_0001/timehist_prim_0001"));
        assert_eq!(manager.state(ScenarioId::Master).unwrap(), ArchiveState::Populating);
    }

    #[test]
    fn events_live_below_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.add_scenario(ScenarioId::Event(2), 0.3).unwrap();
        assert_eq!(manager.scenario_root(ScenarioId::Event(2)), dir.path().join("event_002"));
        assert!(matches!(
            manager.add_scenario(ScenarioId::Event(2), 0.3),
            Err(ArchiveError::DuplicateScenario(_))
        ));
        assert!(matches!(
            manager.remove_scenario(ScenarioId::Master),
            Err(ArchiveError::MasterNotRemovable)
        ));
    }

    #[test]
    fn activate_same_scenario_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let mut rx = manager.subscribe();
        assert!(!manager.activate(ScenarioId::Master, true, true).unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_scenarios_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(matches!(
            manager.snapshot(ScenarioId::Event(9)),
            Err(ArchiveError::UnknownScenario(ScenarioId::Event(9)))
        ));
        assert!(manager.activate(ScenarioId::Event(9), true, true).is_err());
    }

    #[test]
    fn weighted_files_fall_back_to_master() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let weighted = manager.weighted_files("fpp");
        assert_eq!(weighted.len(), 1);
        assert_eq!(weighted[0].scenario, ScenarioId::Master);

        manager.add_scenario(ScenarioId::Event(1), 0.7).unwrap();
        manager.add_scenario(ScenarioId::Event(2), 0.3).unwrap();
        let weighted = manager.weighted_files("fpp");
        assert_eq!(
            weighted.iter().map(|w| w.probability).collect::<Vec<_>>(),
            vec![0.7, 0.3]
        );
    }
}
