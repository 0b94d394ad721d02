//! Read-side result extractors
//!
//! The [`ResultExtractorManager`] keeps two extractors:
//! - The model extractor, over the result files of the active scenario
//! - The possibility extractor, over fixed template files
//!
//! Extractors hold the files they read open. They must be released before
//! anything deletes those files, which is why the archive manager clears them
//! first on close.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the extractor event bus
const EVENT_CAPACITY: usize = 256;

/// Which extractor an event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractorKind {
    /// Result files of the active scenario
    Model,
    /// Template files
    Possibility,
}

/// Notifications emitted by the extractor manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractorEvent {
    /// A new extractor was created
    Created(ExtractorKind),
    /// Files were added to an extractor, so its variable headers changed
    HeaderChanged {
        /// Extractor concerned
        kind: ExtractorKind,
        /// Files added
        files: Vec<PathBuf>,
    },
    /// Files already tracked grew on disk
    DataChanged {
        /// Extractor concerned
        kind: ExtractorKind,
        /// Files that grew
        files: Vec<PathBuf>,
    },
    /// An extractor is about to be deleted
    AboutToDelete(ExtractorKind),
    /// An extractor was deleted and its files released
    Deleted(ExtractorKind),
}

/// Process-wide "new results exist" flag
///
/// Set whenever an extractor's header changes; cleared by whoever consumes
/// the results.
#[derive(Debug, Clone, Default)]
pub struct ResultsFlag(Arc<AtomicBool>);

impl ResultsFlag {
    /// Raise the flag
    #[inline]
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Read the flag
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Read and lower the flag
    #[inline]
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
struct TrackedFile {
    len: u64,
    handle: Option<File>,
}

/// A set of open result files
#[derive(Debug)]
pub struct ResultExtractor {
    kind: ExtractorKind,
    files: BTreeMap<PathBuf, TrackedFile>,
}

impl ResultExtractor {
    /// Create an empty extractor
    #[must_use]
    pub fn new(kind: ExtractorKind) -> Self {
        Self {
            kind,
            files: BTreeMap::new(),
        }
    }

    /// Extractor kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ExtractorKind {
        self.kind
    }

    /// Tracked file paths
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    /// Check if a file is tracked
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    /// Number of files currently held open
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.files.values().filter(|f| f.handle.is_some()).count()
    }

    /// Start tracking files; already tracked ones are skipped
    ///
    /// # Returns
    /// The files that were newly added.
    pub fn add_files<I>(&mut self, paths: I) -> Vec<PathBuf>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut added = Vec::new();
        for path in paths {
            if self.files.contains_key(&path) {
                continue;
            }
            let handle = match File::open(&path) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not open result file");
                    None
                }
            };
            let len = handle
                .as_ref()
                .and_then(|f| f.metadata().ok())
                .map_or(0, |m| m.len());
            self.files.insert(path.clone(), TrackedFile { len, handle });
            added.push(path);
        }
        added
    }

    /// Re-read file sizes
    ///
    /// # Returns
    /// The files that grew since the last refresh.
    pub fn refresh(&mut self) -> Vec<PathBuf> {
        let mut grown = Vec::new();
        for (path, tracked) in &mut self.files {
            let Ok(meta) = std::fs::metadata(path) else {
                continue;
            };
            if meta.len() > tracked.len {
                tracked.len = meta.len();
                if tracked.handle.is_none() {
                    tracked.handle = File::open(path).ok();
                }
                grown.push(path.clone());
            }
        }
        grown
    }
}

/// Owner of the model and possibility extractors
#[derive(Debug)]
pub struct ResultExtractorManager {
    model: Option<ResultExtractor>,
    possibility: Option<ResultExtractor>,
    template_files: Vec<PathBuf>,
    flag: ResultsFlag,
    events: broadcast::Sender<ExtractorEvent>,
}

impl ResultExtractorManager {
    /// Create a manager without any extractor
    #[must_use]
    pub fn new(template_files: Vec<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            model: None,
            possibility: None,
            template_files,
            flag: ResultsFlag::default(),
            events,
        }
    }

    /// Subscribe to extractor events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExtractorEvent> {
        self.events.subscribe()
    }

    /// Shared results flag
    #[inline]
    #[must_use]
    pub fn results_flag(&self) -> ResultsFlag {
        self.flag.clone()
    }

    /// Model extractor, if created
    #[inline]
    #[must_use]
    pub fn model(&self) -> Option<&ResultExtractor> {
        self.model.as_ref()
    }

    /// Possibility extractor, if created
    #[inline]
    #[must_use]
    pub fn possibility(&self) -> Option<&ResultExtractor> {
        self.possibility.as_ref()
    }

    /// Number of result files held open by both extractors
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.model.as_ref().map_or(0, ResultExtractor::open_handles)
            + self
                .possibility
                .as_ref()
                .map_or(0, ResultExtractor::open_handles)
    }

    /// Rebuild both extractors
    ///
    /// The model extractor starts over with `keep`; the possibility
    /// extractor is rebuilt over the template files that exist.
    pub fn renew(&mut self, keep: &BTreeSet<PathBuf>) {
        self.clear();

        let mut model = ResultExtractor::new(ExtractorKind::Model);
        self.emit(ExtractorEvent::Created(ExtractorKind::Model));
        let added = model.add_files(keep.iter().cloned());
        self.model = Some(model);
        self.header_changed(ExtractorKind::Model, added);

        let mut possibility = ResultExtractor::new(ExtractorKind::Possibility);
        self.emit(ExtractorEvent::Created(ExtractorKind::Possibility));
        let templates = self
            .template_files
            .iter()
            .filter(|path| path.is_file())
            .cloned()
            .collect::<Vec<_>>();
        let added = possibility.add_files(templates);
        self.possibility = Some(possibility);
        self.header_changed(ExtractorKind::Possibility, added);

        debug!(kept = keep.len(), "Result extractors renewed");
    }

    /// Release both extractors and their open files
    pub fn clear(&mut self) {
        for kind in [ExtractorKind::Model, ExtractorKind::Possibility] {
            let slot = match kind {
                ExtractorKind::Model => &mut self.model,
                ExtractorKind::Possibility => &mut self.possibility,
            };
            if slot.is_none() {
                continue;
            }
            let _ = self.events.send(ExtractorEvent::AboutToDelete(kind));
            *slot = None;
            let _ = self.events.send(ExtractorEvent::Deleted(kind));
        }
    }

    /// Add result files to the model extractor
    ///
    /// Creates the model extractor if none exists.
    pub fn add_model_files<I>(&mut self, files: I) -> Vec<PathBuf>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        if self.model.is_none() {
            self.model = Some(ResultExtractor::new(ExtractorKind::Model));
            self.emit(ExtractorEvent::Created(ExtractorKind::Model));
        }
        let added = self
            .model
            .as_mut()
            .map(|model| model.add_files(files))
            .unwrap_or_default();
        self.header_changed(ExtractorKind::Model, added.clone());
        added
    }

    /// Detect files that grew and emit data-changed events
    ///
    /// # Returns
    /// Number of grown files across both extractors.
    pub fn poll(&mut self) -> usize {
        let mut total = 0;
        let mut pending = Vec::new();
        if let Some(model) = self.model.as_mut() {
            pending.push((ExtractorKind::Model, model.refresh()));
        }
        if let Some(possibility) = self.possibility.as_mut() {
            pending.push((ExtractorKind::Possibility, possibility.refresh()));
        }
        for (kind, files) in pending {
            if files.is_empty() {
                continue;
            }
            total += files.len();
            self.emit(ExtractorEvent::DataChanged { kind, files });
        }
        total
    }

    fn header_changed(&self, kind: ExtractorKind, files: Vec<PathBuf>) {
        if files.is_empty() {
            return;
        }
        self.flag.set();
        self.emit(ExtractorEvent::HeaderChanged { kind, files });
    }

    fn emit(&self, event: ExtractorEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<ExtractorEvent>) -> Vec<ExtractorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn renew_keeps_files_and_raises_flag() {
        let dir = tempfile::tempdir().unwrap();
        let frs = dir.path().join("part1_001.frs");
        std::fs::write(&frs, b"header").unwrap();

        let mut manager = ResultExtractorManager::new(vec![dir.path().join("missing.frs")]);
        let mut rx = manager.subscribe();
        manager.renew(&BTreeSet::from([frs.clone()]));

        assert!(manager.results_flag().is_set());
        assert!(manager.model().unwrap().contains(&frs));
        assert_eq!(manager.possibility().unwrap().files().count(), 0);
        assert_eq!(manager.open_handles(), 1);

        let events = drain(&mut rx);
        assert!(events.contains(&ExtractorEvent::HeaderChanged {
            kind: ExtractorKind::Model,
            files: vec![frs],
        }));
    }

    #[test]
    fn clear_releases_handles_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let frs = dir.path().join("a.frs");
        std::fs::write(&frs, b"x").unwrap();

        let mut manager = ResultExtractorManager::new(Vec::new());
        manager.renew(&BTreeSet::from([frs]));
        let mut rx = manager.subscribe();
        manager.clear();

        assert_eq!(manager.open_handles(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![
                ExtractorEvent::AboutToDelete(ExtractorKind::Model),
                ExtractorEvent::Deleted(ExtractorKind::Model),
                ExtractorEvent::AboutToDelete(ExtractorKind::Possibility),
                ExtractorEvent::Deleted(ExtractorKind::Possibility),
            ]
        );
    }

    #[test]
    fn poll_reports_growth() {
        let dir = tempfile::tempdir().unwrap();
        let frs = dir.path().join("a.frs");
        std::fs::write(&frs, b"x").unwrap();

        let mut manager = ResultExtractorManager::new(Vec::new());
        manager.add_model_files([frs.clone()]);
        assert_eq!(manager.poll(), 0);

        std::fs::write(&frs, b"xyz").unwrap();
        let mut rx = manager.subscribe();
        assert_eq!(manager.poll(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![ExtractorEvent::DataChanged {
                kind: ExtractorKind::Model,
                files: vec![frs],
            }]
        );
    }

    #[test]
    fn adding_known_files_is_silent() {
        let mut manager = ResultExtractorManager::new(Vec::new());
        manager.add_model_files([PathBuf::from("/nowhere/a.frs")]);
        manager.results_flag().take();
        let added = manager.add_model_files([PathBuf::from("/nowhere/a.frs")]);
        assert!(added.is_empty());
        assert!(!manager.results_flag().is_set());
    }
}
