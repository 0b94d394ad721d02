//! Recovery configuration
//!
//! Loaded from TOML; every field has a default so partial files work.

use crate::error::ConfigError;
use rcy_archive::ArchiveConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the nCode installation
pub const NPATH_ENV: &str = "npath";

/// Settings for running solvers on a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Command prefix that reaches the peer, e.g. `["ssh", "node1"]`
    pub prefix: Vec<String>,
    /// Model directory as seen by the peer
    pub model_dir: String,
}

/// Orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Upper bound on live solver processes
    pub max_concurrent_processes: usize,
    /// Delay before a waiting stage re-checks its dependencies
    pub retry_delay_ms: u64,
    /// Bound on dependency re-checks; unbounded while the scenario has other
    /// live processes when unset
    pub max_dependency_retries: Option<u32>,
    /// Re-check count after which waiting is logged as a warning
    pub warn_after_retries: u32,
    /// Solvers run without a console (`-terminal 7`)
    pub batch_mode: bool,
    /// nCode installation directory; falls back to `$npath`
    pub npath: Option<PathBuf>,
    /// Remote solve settings
    pub remote: Option<RemoteConfig>,
    /// Executable overrides keyed by solver name
    pub executables: BTreeMap<String, PathBuf>,
    /// Archive location and naming
    pub archive: ArchiveConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_processes: 1,
            retry_delay_ms: 500,
            max_dependency_retries: None,
            warn_after_retries: 20,
            batch_mode: false,
            npath: None,
            remote: None,
            executables: BTreeMap::new(),
            archive: ArchiveConfig::default(),
        }
    }
}

impl RecoveryConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the text is not valid or fails validation.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_processes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_processes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.archive.task_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "archive.task_name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Set the concurrency ceiling
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_processes(mut self, max: usize) -> Self {
        self.max_concurrent_processes = max.max(1);
        self
    }

    /// Set the dependency re-check delay
    #[inline]
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Bound the number of dependency re-checks
    #[inline]
    #[must_use]
    pub fn with_max_dependency_retries(mut self, retries: u32) -> Self {
        self.max_dependency_retries = Some(retries);
        self
    }

    /// Run solvers without a console
    #[inline]
    #[must_use]
    pub fn with_batch_mode(mut self, batch: bool) -> Self {
        self.batch_mode = batch;
        self
    }

    /// Set the nCode installation directory
    #[inline]
    #[must_use]
    pub fn with_npath(mut self, npath: impl Into<PathBuf>) -> Self {
        self.npath = Some(npath.into());
        self
    }

    /// Run solvers on a remote peer
    #[inline]
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Override the executable of one solver
    #[inline]
    #[must_use]
    pub fn with_executable(mut self, solver: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.executables.insert(solver.into(), path.into());
        self
    }

    /// Set the archive configuration
    #[inline]
    #[must_use]
    pub fn with_archive(mut self, archive: ArchiveConfig) -> Self {
        self.archive = archive;
        self
    }

    /// Dependency re-check delay
    #[inline]
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// nCode installation directory from configuration or environment
    #[must_use]
    pub fn resolve_npath(&self) -> Option<PathBuf> {
        self.npath
            .clone()
            .or_else(|| std::env::var_os(NPATH_ENV).map(PathBuf::from))
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Program to run for a solver, honoring overrides
    #[must_use]
    pub fn executable(&self, solver: &str) -> String {
        self.executables
            .get(solver)
            .map_or_else(|| solver.to_string(), |p| p.display().to_string())
    }
}
