//! Committed version record
//!
//! Every save writes, per scenario, which task version and which files were
//! committed. Opening an archive trusts this record over whatever else is on
//! disk, so results of a session that never saved stay uncommitted.

use crate::archive::ResultArchive;
use crate::error::{ArchiveError, Result};
use crate::fs::FileSystem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the record, directly in a scenario root
pub const MANIFEST_FILE: &str = "committed.json";

/// What the last save of one scenario committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedManifest {
    /// Committed task version
    pub version: u32,
    /// Committed files, relative to the task directory
    pub files: BTreeSet<PathBuf>,
}

impl CommittedManifest {
    /// Record of an archive's current content
    #[must_use]
    pub fn of(archive: &ResultArchive) -> Self {
        Self {
            version: archive.version(),
            files: archive.relative_files(),
        }
    }

    /// Location of the record below a scenario root
    #[must_use]
    pub fn path(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILE)
    }

    /// Read the record of a scenario root
    ///
    /// # Returns
    /// `None` if the root was never saved.
    ///
    /// # Errors
    /// Returns an error if the record exists but cannot be read or parsed.
    pub fn load(fs: &dyn FileSystem, root: &Path) -> Result<Option<Self>> {
        let path = Self::path(root);
        let text = match fs.read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ArchiveError::io(&path, e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ArchiveError::Manifest { path, source })
    }

    /// Replace the record of a scenario root
    ///
    /// # Errors
    /// Returns an error if the record cannot be serialized or written.
    pub fn store(&self, fs: &dyn FileSystem, root: &Path) -> Result<()> {
        let path = Self::path(root);
        let text = serde_json::to_string_pretty(self).map_err(|source| ArchiveError::Manifest {
            path: path.clone(),
            source,
        })?;
        fs.write_file(&path, text.as_bytes())
            .map_err(|e| ArchiveError::io(&path, e))
    }

    /// Split a listing of the scenario root down to the committed files
    ///
    /// Entries outside the committed task directory are dropped as well.
    #[must_use]
    pub fn committed_entries(&self, task_name: &str, listing: &[PathBuf]) -> Vec<PathBuf> {
        let task_dir = crate::path::versioned_dir_name(task_name, self.version);
        listing
            .iter()
            .filter(|entry| {
                entry
                    .strip_prefix(&task_dir)
                    .is_ok_and(|relative| self.files.contains(relative))
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(CommittedManifest::load(&LocalFileSystem, dir.path()).unwrap(), None);
    }

    #[test]
    fn stored_record_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = CommittedManifest {
            version: 3,
            files: BTreeSet::from([PathBuf::from("timehist_prim_0001/th_p_001.frs")]),
        };
        manifest.store(&LocalFileSystem, dir.path()).unwrap();
        assert_eq!(
            CommittedManifest::load(&LocalFileSystem, dir.path()).unwrap(),
            Some(manifest)
        );
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{ version: ").unwrap();
        assert!(matches!(
            CommittedManifest::load(&LocalFileSystem, dir.path()),
            Err(ArchiveError::Manifest { .. })
        ));
    }

    #[test]
    fn committed_entries_skip_other_versions_and_new_files() {
        let manifest = CommittedManifest {
            version: 1,
            files: BTreeSet::from([PathBuf::from("timehist_prim_0001/th_p_001.frs")]),
        };
        let listing = [
            "response_0001/timehist_prim_0001/th_p_001.frs",
            "response_0001/timehist_prim_0001/th_p_002.frs",
            "response_0002/timehist_prim_0001/th_p_001.frs",
            "committed.json",
        ]
        .map(PathBuf::from);
        assert_eq!(
            manifest.committed_entries("response", &listing),
            vec![PathBuf::from("response_0001/timehist_prim_0001/th_p_001.frs")]
        );
    }
}
