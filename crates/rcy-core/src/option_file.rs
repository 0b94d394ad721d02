//! Solver option files
//!
//! Solvers read their arguments from flag files (`.fco`, `.fop`, `.fao`) and
//! from the command line. Both use the same `-flag value` convention:
//! - `-flag` for a true boolean, `-flag false` for a false one
//! - Text values are double-quoted in files unless added as raw
//! - `#` starts a comment line
//! - User option text is copied verbatim

use crate::error::StageError;
use rcy_archive::FileSystem;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Value of one option
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// Boolean flag
    Flag(bool),
    /// Integer
    Int(i64),
    /// Floating point number
    Real(f64),
    /// Text, quoted when written to a file
    Text(String),
    /// Text written as is
    Raw(String),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&Path> for OptionValue {
    fn from(value: &Path) -> Self {
        Self::Text(portable_path(value))
    }
}

impl From<PathBuf> for OptionValue {
    fn from(value: PathBuf) -> Self {
        Self::Text(portable_path(&value))
    }
}

impl OptionValue {
    fn render(&self, quote: bool) -> Option<String> {
        match self {
            Self::Flag(true) => None,
            Self::Flag(false) => Some("false".to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Real(v) => Some(format_real(*v)),
            Self::Text(v) if quote => Some(format!("\"{v}\"")),
            Self::Text(v) | Self::Raw(v) => Some(v.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Option { key: String, value: OptionValue },
    Comment(String),
    Verbatim(String),
}

/// Ordered collection of solver options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionFileWriter {
    path: Option<PathBuf>,
    entries: Vec<Entry>,
}

impl OptionFileWriter {
    /// Create a writer targeting a file
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            entries: Vec::new(),
        }
    }

    /// Create a writer for command line arguments only
    #[must_use]
    pub fn args() -> Self {
        Self::default()
    }

    /// Target file, if any
    #[inline]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Add an option; the flag's leading dash is added if missing
    pub fn add(&mut self, key: &str, value: impl Into<OptionValue>) -> &mut Self {
        let key = if key.starts_with('-') {
            key.to_string()
        } else {
            format!("-{key}")
        };
        self.entries.push(Entry::Option {
            key,
            value: value.into(),
        });
        self
    }

    /// Add an option whose value must not be quoted
    pub fn add_raw(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.add(key, OptionValue::Raw(value.into()))
    }

    /// Add a comment line
    pub fn add_comment(&mut self, text: &str) -> &mut Self {
        self.entries.push(Entry::Comment(text.to_string()));
        self
    }

    /// Add user option text, copied verbatim
    pub fn add_verbatim(&mut self, text: &str) -> &mut Self {
        self.entries.push(Entry::Verbatim(text.to_string()));
        self
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing was added
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value of the last option with a given flag
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.iter().rev().find_map(|entry| match entry {
            Entry::Option { key: k, value } if k == key => Some(value),
            _ => None,
        })
    }

    /// File content
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                Entry::Option { key, value } => match value.render(true) {
                    Some(v) => {
                        let _ = writeln!(out, "{key} {v}");
                    }
                    None => {
                        let _ = writeln!(out, "{key}");
                    }
                },
                Entry::Comment(text) => {
                    let _ = writeln!(out, "# {text}");
                }
                Entry::Verbatim(text) => {
                    out.push_str(text);
                    if !text.ends_with('\n') {
                        out.push('\n');
                    }
                }
            }
        }
        out
    }

    /// Process argument vector; comments are skipped, verbatim text is split
    /// on whitespace
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for entry in &self.entries {
            match entry {
                Entry::Option { key, value } => {
                    args.push(key.clone());
                    if let Some(v) = value.render(false) {
                        args.push(v);
                    }
                }
                Entry::Comment(_) => {}
                Entry::Verbatim(text) => args.extend(text.split_whitespace().map(str::to_string)),
            }
        }
        args
    }

    /// Write the file through `fs`
    ///
    /// # Errors
    /// Returns [`StageError::Write`] if the writer has no target or the
    /// write fails.
    pub fn write(&self, fs: &dyn FileSystem) -> Result<PathBuf, StageError> {
        let Some(path) = &self.path else {
            return Err(StageError::write(
                PathBuf::new(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no target file"),
            ));
        };
        fs.write_file(path, self.render().as_bytes())
            .map_err(|e| StageError::write(path, e))?;
        Ok(path.clone())
    }
}

/// Path with forward slashes, as solvers on every platform accept them
#[must_use]
pub fn portable_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Shortest decimal form of a number, `1` rather than `1.0`
#[must_use]
pub fn format_real(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1.0e15 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rcy_archive::LocalFileSystem;

    #[test]
    fn renders_flag_file_conventions() {
        let mut fop = OptionFileWriter::new("/tmp/fedem_gage.fop");
        fop.add_comment("Output options")
            .add("-resfile", "fedem_gage.res")
            .add("rdbinc", 3)
            .add("-statm", 0.5)
            .add("-consolemsg", true)
            .add("-fatigue", false)
            .add_raw("-frsfile", "<\"a.frs\",\"b.frs\">")
            .add_verbatim("-debug 1 -extra");

        assert_eq!(
            fop.render(),
            "# Output options\n\
             -resfile \"fedem_gage.res\"\n\
             -rdbinc 3\n\
             -statm 0.5\n\
             -consolemsg\n\
             -fatigue false\n\
             -frsfile <\"a.frs\",\"b.frs\">\n\
             -debug 1 -extra\n"
        );
    }

    #[test]
    fn argument_vector_is_unquoted() {
        let mut args = OptionFileWriter::args();
        args.add("-fco", "fedem_stress.fco")
            .add("-consolemsg", true)
            .add("-terminal", -1)
            .add_verbatim("  -x  1 ");
        assert_eq!(
            args.to_args(),
            vec!["-fco", "fedem_stress.fco", "-consolemsg", "-terminal", "-1", "-x", "1"]
        );
    }

    #[test]
    fn whole_reals_have_no_fraction() {
        assert_eq!(format_real(1.0), "1");
        assert_eq!(format_real(-3.0), "-3");
        assert_eq!(format_real(0.25), "0.25");
    }

    #[test]
    fn write_without_target_fails() {
        assert!(OptionFileWriter::args().write(&LocalFileSystem).is_err());
    }

    #[test]
    fn get_returns_last_value() {
        let mut w = OptionFileWriter::args();
        w.add("-terminal", 7).add("-terminal", -1);
        assert_eq!(w.get("-terminal"), Some(&OptionValue::Int(-1)));
        assert_eq!(w.get("-missing"), None);
    }

    #[test]
    fn paths_use_forward_slashes() {
        assert_eq!(portable_path(Path::new(r"..\reduced\part_B.fmx")), "../reduced/part_B.fmx");
    }
}
