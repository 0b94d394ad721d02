//! Filesystem seam
//!
//! Archives never touch the disk themselves; the manager goes through
//! [`FileSystem`] so that listing, copying and deleting can be faked.

use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Filesystem operations needed by the archive manager
pub trait FileSystem: Send + Sync + Debug {
    /// List all regular files below `root`, relative to `root`
    ///
    /// A missing `root` yields an empty listing.
    ///
    /// # Errors
    /// Returns the underlying i/o error if the walk fails.
    fn list_files(&self, root: &Path) -> io::Result<Vec<PathBuf>>;

    /// Check if `path` is an existing regular file
    fn is_file(&self, path: &Path) -> bool;

    /// Check if `path` is an existing directory
    fn is_dir(&self, path: &Path) -> bool;

    /// Create a directory and all its parents
    ///
    /// # Errors
    /// Returns the underlying i/o error.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Read a whole file as text
    ///
    /// # Errors
    /// Returns the underlying i/o error, `NotFound` for a missing file.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Replace a file's content, creating its parent directories
    ///
    /// Readers see either the old or the new content, never a partial write.
    ///
    /// # Errors
    /// Returns the underlying i/o error.
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Copy one file, creating the target's parent directories
    ///
    /// # Errors
    /// Returns the underlying i/o error.
    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Delete one file; a missing file is not an error
    ///
    /// # Errors
    /// Returns the underlying i/o error.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Delete a directory tree; a missing directory is not an error
    ///
    /// # Errors
    /// Returns the underlying i/o error.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Delete every empty directory below and including `root`
    ///
    /// # Returns
    /// Number of directories removed.
    ///
    /// # Errors
    /// Returns the underlying i/o error.
    fn prune_empty_dirs(&self, root: &Path) -> io::Result<usize>;

    /// Delete `path` if it is an empty directory
    ///
    /// # Returns
    /// `true` if the directory was removed.
    ///
    /// # Errors
    /// Returns the underlying i/o error.
    fn remove_dir_if_empty(&self, path: &Path) -> io::Result<bool>;
}

/// [`FileSystem`] backed by the local disk
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn list_files(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
        Ok(files)
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut staging = path.as_os_str().to_owned();
        staging.push(".part");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, contents)?;
        std::fs::rename(&staging, path)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to).map(|_| ())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn prune_empty_dirs(&self, root: &Path) -> io::Result<usize> {
        if !root.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in WalkDir::new(root).contents_first(true) {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_dir() && self.remove_dir_if_empty(entry.path())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn remove_dir_if_empty(&self, path: &Path) -> io::Result<bool> {
        if !path.is_dir() || std::fs::read_dir(path)?.next().is_some() {
            return Ok(false);
        }
        std::fs::remove_dir(path)?;
        Ok(true)
    }
}
