//! Sub-task paths and versioned directory names
//!
//! Provides [`TaskPath`] for addressing a sub-task inside an archive tree,
//! and the `<name>_<version>` directory naming every task level uses on disk.

use crate::error::PathError;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Path of a sub-task below the archive's root task
///
/// Segments are sub-task names without version suffixes; versions are
/// resolved against the archive when the path is turned into a directory.
///
/// # Examples
/// - `["timehist_prim"]` → `timehist_prim`
/// - `["timehist_rcy", "part1"]` → `timehist_rcy/part1`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskPath(Vec<String>);

impl TaskPath {
    /// Create a path from validated segments
    ///
    /// # Errors
    /// Returns [`PathError`] if a segment is empty, `.`/`..`, or contains a
    /// path separator.
    pub fn new<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment, &segments)?;
        }
        Ok(Self(segments))
    }

    /// Create a path from a single segment
    ///
    /// # Errors
    /// Same as [`TaskPath::new`].
    pub fn single(segment: impl Into<String>) -> Result<Self, PathError> {
        Self::new([segment.into()])
    }

    /// Empty path (the root task itself)
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Get path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Get number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if path is the root
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get parent path (if not root)
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.0.split_last()?;
        Some(Self(rest.to_vec()))
    }

    /// Get last segment (if not root)
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Append a segment, returning a new path
    ///
    /// # Errors
    /// Returns [`PathError`] if the segment is invalid.
    pub fn child(&self, segment: impl Into<String>) -> Result<Self, PathError> {
        let segment = segment.into();
        validate_segment(&segment, &self.0)?;
        let mut new = self.clone();
        new.0.push(segment);
        Ok(new)
    }
}

fn validate_segment(segment: &str, whole: &[String]) -> Result<(), PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment(whole.join("/")));
    }
    if segment == "." || segment == ".." {
        return Err(PathError::ReservedSegment(segment.to_string()));
    }
    if segment.contains(['/', '\\']) {
        return Err(PathError::Separator(segment.to_string()));
    }
    Ok(())
}

impl Display for TaskPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl FromStr for TaskPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        Self::new(s.split('/'))
    }
}

/// On-disk directory name of a task level, `<name>_<version:04>`
#[inline]
#[must_use]
pub fn versioned_dir_name(name: &str, version: u32) -> String {
    format!("{name}_{version:04}")
}

/// Split a versioned directory name into task name and version
///
/// Returns `None` when the name carries no numeric version suffix.
#[must_use]
pub fn parse_versioned_dir(dir: &str) -> Option<(&str, u32)> {
    let (name, digits) = dir.rsplit_once('_')?;
    if name.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((name, digits.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_path_display_and_parse() {
        let path: TaskPath = "timehist_rcy/part1".parse().unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path.last(), Some("part1"));
        assert_eq!(path.to_string(), "timehist_rcy/part1");
        assert_eq!(path.parent().unwrap().to_string(), "timehist_rcy");
        assert!("".parse::<TaskPath>().unwrap().is_empty());
    }

    #[test]
    fn task_path_rejects_escapes() {
        assert!(matches!(TaskPath::single(".."), Err(PathError::ReservedSegment(_))));
        assert!(matches!(TaskPath::single("a/b"), Err(PathError::Separator(_))));
        assert!(matches!("a//b".parse::<TaskPath>(), Err(PathError::EmptySegment(_))));
    }

    #[test]
    fn versioned_dir_round_trip() {
        let dir = versioned_dir_name("timehist_prim", 3);
        assert_eq!(dir, "timehist_prim_0003");
        assert_eq!(parse_versioned_dir(&dir), Some(("timehist_prim", 3)));
    }

    #[test]
    fn unversioned_dirs_are_rejected() {
        assert_eq!(parse_versioned_dir("event_003"), Some(("event", 3)));
        assert_eq!(parse_versioned_dir("timehist_prim"), None);
        assert_eq!(parse_versioned_dir("_0001"), None);
        assert_eq!(parse_versioned_dir("plain"), None);
    }
}
