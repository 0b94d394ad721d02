//! Result archive tree
//!
//! A [`ResultArchive`] records which result files belong to one scenario:
//! - A root task (`response` by default) with a version counter
//! - Named [`SubTask`] children forming a path-like hierarchy
//! - Per sub-task, filename sets keyed by file category (extension)
//!
//! On disk every level is a `<name>_<version:04>` directory. The archive does
//! no i/o of its own; [`ResultArchive::sync`] reconciles it against a listing
//! supplied by the caller.

use crate::increment::{category_of, latest};
use crate::path::{parse_versioned_dir, versioned_dir_name, TaskPath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

/// Default name of the root task
pub const DEFAULT_TASK_NAME: &str = "response";

/// One node of the archive tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTask {
    name: String,
    version: u32,
    files: BTreeMap<String, BTreeSet<String>>,
    children: BTreeMap<String, SubTask>,
}

impl SubTask {
    /// Create an empty sub-task at version 1
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_version(name, 1)
    }

    /// Create an empty sub-task at a given version
    #[must_use]
    pub fn with_version(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            files: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    /// Sub-task name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version counter
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Directory name on disk
    #[inline]
    #[must_use]
    pub fn dir_name(&self) -> String {
        versioned_dir_name(&self.name, self.version)
    }

    /// Get a direct child by name
    #[inline]
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&SubTask> {
        self.children.get(name)
    }

    /// Iterate over direct children in name order
    pub fn children(&self) -> impl Iterator<Item = &SubTask> {
        self.children.values()
    }

    /// Get or create a direct child
    pub fn add_child(&mut self, name: &str) -> &mut SubTask {
        self.children
            .entry(name.to_string())
            .or_insert_with(|| SubTask::new(name))
    }

    /// Filenames of one category
    pub fn files(&self, category: &str) -> impl Iterator<Item = &str> {
        self.files
            .get(category)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Categories that hold at least one file
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(category, _)| category.as_str())
    }

    /// Check if a file is recorded in this sub-task
    #[must_use]
    pub fn contains(&self, file_name: &str) -> bool {
        self.files
            .get(category_of(file_name))
            .is_some_and(|set| set.contains(file_name))
    }

    /// Record a file, keyed by its extension
    ///
    /// # Returns
    /// `true` if the file was not recorded before.
    pub fn add_file(&mut self, file_name: impl Into<String>) -> bool {
        let file_name = file_name.into();
        self.files
            .entry(category_of(&file_name).to_string())
            .or_default()
            .insert(file_name)
    }

    /// Forget a file
    ///
    /// # Returns
    /// `true` if the file was recorded.
    pub fn remove_file(&mut self, file_name: &str) -> bool {
        let category = category_of(file_name);
        let Some(set) = self.files.get_mut(category) else {
            return false;
        };
        let removed = set.remove(file_name);
        if set.is_empty() {
            self.files.remove(category);
        }
        removed
    }

    /// Latest increment of a category in this sub-task (not recursive)
    #[must_use]
    pub fn latest(&self, category: &str) -> Option<&str> {
        latest(self.files(category), category)
    }

    /// Number of files in this sub-task and all its descendants
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.values().map(BTreeSet::len).sum::<usize>()
            + self.children.values().map(SubTask::file_count).sum::<usize>()
    }

    /// Check if neither this sub-task nor any descendant holds files
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }

    fn collect_files(&self, dir: &Path, out: &mut BTreeSet<PathBuf>) {
        for set in self.files.values() {
            for file in set {
                out.insert(dir.join(file));
            }
        }
        for child in self.children.values() {
            child.collect_files(&dir.join(child.dir_name()), out);
        }
    }

    fn collect_category(&self, dir: &Path, category: &str, out: &mut Vec<PathBuf>) {
        out.extend(self.files(category).map(|file| dir.join(file)));
        for child in self.children.values() {
            child.collect_category(&dir.join(child.dir_name()), category, out);
        }
    }

    /// Copy of this node with the structure kept and all files dropped
    fn skeleton(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version,
            files: BTreeMap::new(),
            children: self
                .children
                .iter()
                .map(|(name, child)| (name.clone(), child.skeleton()))
                .collect(),
        }
    }

    /// Re-add sub-tasks known in `previous` but absent from this scanned tree
    fn keep_structure_of(&mut self, previous: &SubTask) {
        for (name, old) in &previous.children {
            match self.children.get_mut(name) {
                Some(child) => child.keep_structure_of(old),
                None => {
                    self.children.insert(name.clone(), old.skeleton());
                }
            }
        }
    }
}

/// Outcome of reconciling an archive with the disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Files found on disk that were not recorded
    pub added: Vec<PathBuf>,
    /// Recorded files no longer on disk
    pub removed: Vec<PathBuf>,
    /// Files on disk belonging to a non-current version of a sub-task
    pub superseded: Vec<PathBuf>,
}

impl SyncReport {
    /// Check if nothing changed
    #[inline]
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The result file record of one scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultArchive {
    root_path: PathBuf,
    root: SubTask,
}

impl ResultArchive {
    /// Create an empty archive with its root task at version 1
    #[must_use]
    pub fn new(root_path: impl Into<PathBuf>, task_name: &str) -> Self {
        Self {
            root_path: root_path.into(),
            root: SubTask::new(task_name),
        }
    }

    /// Rebuild an archive from a listing of `root_path`
    ///
    /// The highest task version present on disk becomes the current one.
    #[must_use]
    pub fn open(root_path: impl Into<PathBuf>, task_name: &str, listing: &[PathBuf]) -> Self {
        let version = task_versions(task_name, listing).max().unwrap_or(1);
        Self::open_version(root_path, task_name, version, listing)
    }

    /// Rebuild an archive at a known task version from a listing
    #[must_use]
    pub fn open_version(
        root_path: impl Into<PathBuf>,
        task_name: &str,
        version: u32,
        listing: &[PathBuf],
    ) -> Self {
        let mut archive = Self {
            root_path: root_path.into(),
            root: SubTask::with_version(task_name, version),
        };
        archive.sync(listing);
        archive
    }

    /// Directory holding the task directories
    #[inline]
    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Root task node
    #[inline]
    #[must_use]
    pub fn root(&self) -> &SubTask {
        &self.root
    }

    /// Root task name
    #[inline]
    #[must_use]
    pub fn task_name(&self) -> &str {
        self.root.name()
    }

    /// Current task version
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.root.version()
    }

    /// Directory of the current task version
    #[must_use]
    pub fn task_dir(&self) -> PathBuf {
        self.root_path.join(self.root.dir_name())
    }

    /// Check if no files are recorded
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Look up a sub-task
    #[must_use]
    pub fn sub_task(&self, path: &TaskPath) -> Option<&SubTask> {
        path.segments()
            .iter()
            .try_fold(&self.root, |node, segment| node.child(segment))
    }

    /// Get or create a sub-task and all its ancestors
    ///
    /// Idempotent; returns the sub-task's directory.
    pub fn add_sub_task(&mut self, path: &TaskPath) -> PathBuf {
        let mut dir = self.task_dir();
        let mut node = &mut self.root;
        for segment in path.segments() {
            node = node.add_child(segment);
            dir.push(node.dir_name());
        }
        dir
    }

    /// Directory of an existing sub-task
    #[must_use]
    pub fn dir_of(&self, path: &TaskPath) -> Option<PathBuf> {
        let mut dir = self.task_dir();
        let mut node = &self.root;
        for segment in path.segments() {
            node = node.child(segment)?;
            dir.push(node.dir_name());
        }
        Some(dir)
    }

    /// All recorded files as absolute paths
    #[must_use]
    pub fn all_files(&self) -> BTreeSet<PathBuf> {
        let mut out = BTreeSet::new();
        self.root.collect_files(&self.task_dir(), &mut out);
        out
    }

    /// All recorded files relative to the current task directory
    #[must_use]
    pub fn relative_files(&self) -> BTreeSet<PathBuf> {
        let mut out = BTreeSet::new();
        self.root.collect_files(Path::new(""), &mut out);
        out
    }

    /// Absolute paths of every file of one category, in tree order
    #[must_use]
    pub fn files_of_category(&self, category: &str) -> Vec<PathBuf> {
        let mut out = Vec::new();
        self.root
            .collect_category(&self.task_dir(), category, &mut out);
        out
    }

    /// Bump the task version
    ///
    /// The new version directory starts empty, so the recorded tree is reset
    /// to its structure; files of the previous version stay on disk until the
    /// next save or close.
    pub fn increment_version(&mut self) {
        let mut root = self.root.skeleton();
        root.version = self.root.version.saturating_add(1);
        self.root = root;
    }

    /// Copy of this archive rooted elsewhere, as task version 1
    #[must_use]
    pub fn relocated(&self, new_root: impl Into<PathBuf>) -> Self {
        let mut root = self.root.clone();
        root.version = 1;
        Self {
            root_path: new_root.into(),
            root,
        }
    }

    /// Reconcile the record with a listing of `root_path`
    ///
    /// `listing` holds file paths relative to `root_path`. Only entries in
    /// the current task version directory are considered; of several
    /// versions of the same sub-task the recorded one wins if present on
    /// disk, else the highest. Entries with unversioned directory segments
    /// are ignored.
    pub fn sync(&mut self, listing: &[PathBuf]) -> SyncReport {
        let task_dir_name = self.root.dir_name();
        let mut scan = ScanNode::default();
        for entry in listing {
            let mut parts = entry.components().filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            });
            if parts.next() != Some(task_dir_name.as_str()) {
                continue;
            }
            scan.insert(&parts.collect::<Vec<_>>());
        }

        let mut superseded = Vec::new();
        let task_dir = self.task_dir();
        let mut scanned = scan.build(
            self.root.name(),
            self.root.version(),
            Some(&self.root),
            &task_dir,
            &mut superseded,
        );
        scanned.keep_structure_of(&self.root);

        let before = self.relative_files();
        self.root = scanned;
        let after = self.relative_files();

        SyncReport {
            added: after
                .difference(&before)
                .map(|p| task_dir.join(p))
                .collect(),
            removed: before
                .difference(&after)
                .map(|p| task_dir.join(p))
                .collect(),
            superseded,
        }
    }
}

/// Versions of `task_name` present as top-level directories in a listing
pub fn task_versions<'a>(task_name: &'a str, listing: &'a [PathBuf]) -> impl Iterator<Item = u32> + 'a {
    listing.iter().filter_map(move |entry| {
        let first = entry.components().next()?;
        let Component::Normal(first) = first else {
            return None;
        };
        // a bare file at the top level is not a task directory
        if entry.components().count() < 2 {
            return None;
        }
        match parse_versioned_dir(first.to_str()?) {
            Some((name, version)) if name == task_name => Some(version),
            _ => None,
        }
    })
}

#[derive(Debug, Default)]
struct ScanNode {
    files: BTreeSet<String>,
    children: BTreeMap<String, BTreeMap<u32, ScanNode>>,
}

impl ScanNode {
    fn insert(&mut self, parts: &[&str]) {
        let Some((file, dirs)) = parts.split_last() else {
            return;
        };
        let mut node = self;
        for dir in dirs {
            let Some((name, version)) = parse_versioned_dir(dir) else {
                return;
            };
            node = node
                .children
                .entry(name.to_string())
                .or_default()
                .entry(version)
                .or_default();
        }
        node.files.insert((*file).to_string());
    }

    fn build(
        self,
        name: &str,
        version: u32,
        previous: Option<&SubTask>,
        dir: &Path,
        superseded: &mut Vec<PathBuf>,
    ) -> SubTask {
        let mut sub = SubTask::with_version(name, version);
        for file in self.files {
            sub.add_file(file);
        }
        for (child_name, versions) in self.children {
            let previous_child = previous.and_then(|p| p.child(&child_name));
            let chosen = previous_child
                .map(SubTask::version)
                .filter(|v| versions.contains_key(v))
                .or_else(|| versions.keys().next_back().copied());
            for (child_version, node) in versions {
                let child_dir = dir.join(versioned_dir_name(&child_name, child_version));
                if Some(child_version) == chosen {
                    let child = node.build(
                        &child_name,
                        child_version,
                        previous_child,
                        &child_dir,
                        superseded,
                    );
                    sub.children.insert(child_name.clone(), child);
                } else {
                    node.collect(&child_dir, superseded);
                }
            }
        }
        sub
    }

    fn collect(self, dir: &Path, out: &mut Vec<PathBuf>) {
        out.extend(self.files.into_iter().map(|f| dir.join(f)));
        for (name, versions) in self.children {
            for (version, node) in versions {
                node.collect(&dir.join(versioned_dir_name(&name, version)), out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn listing(paths: &[&str]) -> Vec<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    fn tp(s: &str) -> TaskPath {
        s.parse().unwrap()
    }

    #[test]
    fn add_sub_task_is_idempotent() {
        let mut archive = ResultArchive::new("/rdb", DEFAULT_TASK_NAME);
        let first = archive.add_sub_task(&tp("timehist_rcy/part1"));
        let second = archive.add_sub_task(&tp("timehist_rcy/part1"));
        assert_eq!(first, second);
        assert_eq!(
            first,
            PathBuf::from("/rdb/response_0001/timehist_rcy_0001/part1_0001")
        );
        assert_eq!(archive.root().children().count(), 1);
    }

    #[test]
    fn sync_adds_and_removes() {
        let mut archive = ResultArchive::new("/rdb", DEFAULT_TASK_NAME);
        let report = archive.sync(&listing(&[
            "response_0001/fedem_solver.fsi",
            "response_0001/timehist_prim_0001/th_p_001.frs",
        ]));
        assert_eq!(report.added.len(), 2);
        assert!(report.removed.is_empty());

        let prim = archive.sub_task(&tp("timehist_prim")).unwrap();
        assert_eq!(prim.latest("frs"), Some("th_p_001.frs"));

        let report = archive.sync(&listing(&["response_0001/fedem_solver.fsi"]));
        assert!(report.added.is_empty());
        assert_eq!(
            report.removed,
            vec![PathBuf::from("/rdb/response_0001/timehist_prim_0001/th_p_001.frs")]
        );
        // the emptied sub-task is still known
        assert!(archive.sub_task(&tp("timehist_prim")).is_some());
    }

    #[test]
    fn sync_ignores_other_task_versions_and_events() {
        let mut archive = ResultArchive::new("/rdb", DEFAULT_TASK_NAME);
        archive.sync(&listing(&[
            "response_0002/timehist_prim_0001/th_p_001.frs",
            "event_001/response_0001/timehist_prim_0001/th_p_001.frs",
            "response_0001/notes/readme.txt",
        ]));
        assert!(archive.is_empty());
    }

    #[test]
    fn sync_reports_superseded_sub_task_versions() {
        let mut archive = ResultArchive::new("/rdb", DEFAULT_TASK_NAME);
        let report = archive.sync(&listing(&[
            "response_0001/timehist_prim_0001/th_p_001.frs",
            "response_0001/timehist_prim_0002/th_p_001.frs",
        ]));
        assert_eq!(archive.sub_task(&tp("timehist_prim")).unwrap().version(), 2);
        assert_eq!(
            report.superseded,
            vec![PathBuf::from("/rdb/response_0001/timehist_prim_0001/th_p_001.frs")]
        );
    }

    #[test]
    fn open_picks_highest_task_version() {
        let archive = ResultArchive::open(
            "/rdb",
            DEFAULT_TASK_NAME,
            &listing(&[
                "response_0001/timehist_prim_0001/th_p_001.frs",
                "response_0003/timehist_prim_0001/th_p_002.frs",
            ]),
        );
        assert_eq!(archive.version(), 3);
        assert_eq!(
            archive.all_files().into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("/rdb/response_0003/timehist_prim_0001/th_p_002.frs")]
        );
    }

    #[test]
    fn increment_resets_files_and_keeps_structure() {
        let mut archive = ResultArchive::new("/rdb", DEFAULT_TASK_NAME);
        archive.sync(&listing(&["response_0001/timehist_rcy_0001/part1_0001/part1_001.frs"]));
        archive.increment_version();
        assert_eq!(archive.version(), 2);
        assert!(archive.is_empty());
        assert_eq!(
            archive.dir_of(&tp("timehist_rcy/part1")),
            Some(PathBuf::from("/rdb/response_0002/timehist_rcy_0001/part1_0001"))
        );
    }

    #[test]
    fn relocated_copy_restarts_at_version_one() {
        let mut archive = ResultArchive::new("/old", DEFAULT_TASK_NAME);
        archive.increment_version();
        archive.sync(&listing(&["response_0002/timehist_prim_0001/th_p_001.frs"]));
        let moved = archive.relocated("/new");
        assert_eq!(moved.version(), 1);
        assert_eq!(moved.relative_files(), archive.relative_files());
        assert_eq!(moved.task_dir(), PathBuf::from("/new/response_0001"));
    }

    #[test]
    fn files_of_category_walks_the_tree() {
        let mut archive = ResultArchive::new("/rdb", DEFAULT_TASK_NAME);
        archive.sync(&listing(&[
            "response_0001/summary_rcy_0001/part1_0001/part1_fpp_001.fpp",
            "response_0001/summary_rcy_0001/part2_0001/part2_fpp_001.fpp",
            "response_0001/summary_rcy_0001/part2_0001/part2_001.frs",
        ]));
        assert_eq!(archive.files_of_category("fpp").len(), 2);
        assert_eq!(archive.files_of_category("frs").len(), 1);
    }
}
