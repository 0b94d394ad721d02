//! Model collaborator
//!
//! Stages read parts, per-stage options and license flags through
//! [`ModelProvider`]; they never own model objects. [`StaticModel`] is a
//! TOML-backed provider used by the CLI and in tests.

use crate::error::ConfigError;
use crate::types::{PartId, StageKind};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Time window of a recovery run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindow {
    /// First time to process
    pub start: f64,
    /// Last time to process
    pub stop: f64,
    /// Time increment; ignored when `all_steps` is set
    pub increment: f64,
    /// Process every saved time step
    pub all_steps: bool,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 1.0,
            increment: 0.01,
            all_steps: false,
        }
    }
}

impl TimeWindow {
    /// Number of time steps in the window
    ///
    /// `expected_steps` is used when every saved step is processed, since
    /// the solver decides the count then.
    #[must_use]
    pub fn step_count(&self, expected_steps: usize) -> usize {
        if self.all_steps || self.increment <= 0.0 {
            return expected_steps.max(1);
        }
        let span = (self.stop - self.start).max(0.0);
        let ratio = (span / self.increment).round();
        if !ratio.is_finite() {
            return expected_steps.max(1);
        }
        // the cast saturates for windows too fine to count
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let steps = ratio as usize;
        steps.saturating_add(1)
    }
}

/// Export of recovered results to a VTF file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VtfExport {
    /// Output file, shared by all parts of a batch
    pub file: PathBuf,
    /// Write the express format
    #[serde(default)]
    pub express: bool,
    /// Steps to reserve per part when every saved step is processed
    #[serde(default = "default_expected_steps")]
    pub expected_steps: usize,
}

fn default_expected_steps() -> usize {
    100
}

/// Options of the dynamics solver
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Time window
    pub window: TimeWindow,
    /// Content of the solver input file
    pub input: String,
    /// Extra options passed verbatim
    pub add_options: String,
}

/// Options of stress recovery
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StressOptions {
    /// Time window
    pub window: TimeWindow,
    /// Recover deformations
    pub deformation: bool,
    /// Recover stress tensors
    pub stress_tensor: bool,
    /// Recover strain tensors
    pub strain_tensor: bool,
    /// Recover von Mises stress
    pub von_mises_stress: bool,
    /// Recover von Mises strain
    pub von_mises_strain: bool,
    /// Recover maximum principal stress
    pub max_principal_stress: bool,
    /// Recover minimum principal stress
    pub min_principal_stress: bool,
    /// Recover maximum shear stress
    pub max_shear_stress: bool,
    /// Optional VTF export
    pub vtf: Option<VtfExport>,
    /// Extra options passed verbatim
    pub add_options: String,
}

/// Options of strain gage recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GageOptions {
    /// Time window
    pub window: TimeWindow,
    /// Compute rainflow and damage for each gage
    pub fatigue: bool,
    /// Rainflow bin size, in model stress units
    pub bin_size: f64,
    /// Resampling rate for DAC output; solver default when unset
    pub dac_sample_rate: Option<f64>,
    /// Extra options passed verbatim
    pub add_options: String,
}

impl Default for GageOptions {
    fn default() -> Self {
        Self {
            window: TimeWindow::default(),
            fatigue: false,
            bin_size: 10.0,
            dac_sample_rate: None,
            add_options: String::new(),
        }
    }
}

/// One mode to expand at one time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeRequest {
    /// Time of the eigenvalue solution
    pub time: f64,
    /// Mode number
    pub mode: u32,
}

/// Options of mode shape expansion
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModesOptions {
    /// Whether the solver computed eigenvalues at all
    pub solve_eigenvalues: bool,
    /// Expand damped modes
    pub damped: bool,
    /// Modes to expand
    pub modes: Vec<ModeRequest>,
    /// Optional VTF export
    pub vtf: Option<VtfExport>,
    /// Extra options passed verbatim
    pub add_options: String,
}

/// Options of strain coat recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrainCoatOptions {
    /// Time window
    pub window: TimeWindow,
    /// Elements processed together
    pub elements_together: u32,
    /// Biaxiality gate value
    pub biaxial_gate: f64,
    /// Do rainflow counting and damage calculation
    pub rainflow: bool,
    /// Peak-valley extraction gate
    pub pvx_gate: f64,
    /// Histogram data type
    pub hist_data_type: u32,
    /// S-N curve file
    pub sn_file: Option<PathBuf>,
    /// Extra options passed verbatim
    pub add_options: String,
}

impl Default for StrainCoatOptions {
    fn default() -> Self {
        Self {
            window: TimeWindow::default(),
            elements_together: 5000,
            biaxial_gate: 10.0,
            rainflow: false,
            pvx_gate: 10.0,
            hist_data_type: 1,
            sn_file: None,
            add_options: String::new(),
        }
    }
}

/// Licensed features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseFlags {
    /// Stress recovery
    pub stress: bool,
    /// Strain gage recovery
    pub gage: bool,
    /// Mode shape expansion
    pub modes: bool,
    /// Strain coat recovery
    pub strain_coat: bool,
    /// FE fatigue evaluation
    pub fe_fatigue: bool,
    /// VTF export
    pub vtf_export: bool,
    /// Remote solving
    pub remote_solve: bool,
}

impl Default for LicenseFlags {
    fn default() -> Self {
        Self {
            stress: true,
            gage: true,
            modes: true,
            strain_coat: true,
            fe_fatigue: true,
            vtf_export: true,
            remote_solve: true,
        }
    }
}

impl LicenseFlags {
    /// Check if a stage kind is licensed
    #[must_use]
    pub fn allows(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Solver => true,
            StageKind::Stress => self.stress,
            StageKind::Gage => self.gage,
            StageKind::Modes => self.modes,
            StageKind::StrainCoat => self.strain_coat,
            StageKind::FeFatigue => self.fe_fatigue,
        }
    }
}

/// One FE part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartInfo {
    /// Part name
    pub id: PartId,
    /// Base id passed to the solvers as link id
    pub base_id: i64,
    /// FE data file, relative to the model directory unless absolute
    pub fe_file: PathBuf,
    /// Directory of the reduced matrices, relative to the model directory
    /// unless absolute
    pub reduced_dir: PathBuf,
    /// Number of generalized (component) modes
    #[serde(default)]
    pub component_modes: u32,
    /// Strain rosette definitions, one line each
    #[serde(default)]
    pub rosettes: Vec<String>,
    /// Residual stress file
    #[serde(default)]
    pub residual_stress_file: Option<PathBuf>,
}

impl PartInfo {
    /// Create a part with default reduced-matrix layout
    #[must_use]
    pub fn new(name: &str, base_id: i64) -> Self {
        Self {
            id: PartId::new(name),
            base_id,
            fe_file: PathBuf::from(format!("{name}.nas")),
            reduced_dir: PathBuf::from(format!("{name}_reduced")),
            component_modes: 0,
            rosettes: Vec::new(),
            residual_stress_file: None,
        }
    }

    /// Base name of the FE data file, used to name result files
    #[must_use]
    pub fn base_name(&self) -> String {
        self.fe_file
            .file_stem()
            .and_then(|s| s.to_str())
            .map_or_else(|| self.id.to_string(), str::to_string)
    }

    /// Absolute FE data file
    #[must_use]
    pub fn fe_data_file(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(&self.fe_file)
    }

    /// Absolute path of a reduced matrix file, e.g. `B.fmx`
    #[must_use]
    pub fn reduced_file(&self, model_dir: &Path, suffix: &str) -> PathBuf {
        model_dir
            .join(&self.reduced_dir)
            .join(format!("{}_{suffix}", self.base_name()))
    }
}

/// Source of model data for the stages
pub trait ModelProvider: Send + Sync + Debug {
    /// Directory of the model file
    fn model_dir(&self) -> &Path;

    /// Look up a part
    fn part(&self, id: &PartId) -> Option<PartInfo>;

    /// All parts in model order
    fn parts(&self) -> Vec<PartId>;

    /// Dynamics solver options
    fn solver_options(&self) -> SolverOptions;

    /// Stress recovery options
    fn stress_options(&self) -> StressOptions;

    /// Strain gage recovery options
    fn gage_options(&self) -> GageOptions;

    /// Mode shape expansion options
    fn modes_options(&self) -> ModesOptions;

    /// Strain coat recovery options
    fn strain_coat_options(&self) -> StrainCoatOptions;

    /// Licensed features
    fn licenses(&self) -> LicenseFlags;

    /// Factor converting model stress units to MPa
    fn stress_to_mpa_scale(&self) -> f64;
}

/// Scenario declared in a model file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    /// Event number
    pub id: u32,
    /// Probability weight
    pub probability: f64,
}

/// [`ModelProvider`] read from a TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticModel {
    /// Directory of the model file
    pub model_dir: PathBuf,
    /// FE parts
    pub parts: Vec<PartInfo>,
    /// Simulation events
    pub events: Vec<EventSpec>,
    /// Dynamics solver options
    pub solver: SolverOptions,
    /// Stress recovery options
    pub stress: StressOptions,
    /// Strain gage recovery options
    pub gage: GageOptions,
    /// Mode shape expansion options
    pub modes: ModesOptions,
    /// Strain coat recovery options
    pub strain_coat: StrainCoatOptions,
    /// Licensed features
    pub licenses: LicenseFlags,
    /// Factor converting model stress units to MPa
    pub stress_to_mpa_scale: f64,
}

impl Default for StaticModel {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("."),
            parts: Vec::new(),
            events: Vec::new(),
            solver: SolverOptions::default(),
            stress: StressOptions::default(),
            gage: GageOptions::default(),
            modes: ModesOptions::default(),
            strain_coat: StrainCoatOptions::default(),
            licenses: LicenseFlags::default(),
            stress_to_mpa_scale: 1.0e-6,
        }
    }
}

impl StaticModel {
    /// Create an empty model rooted at `model_dir`
    #[must_use]
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            ..Self::default()
        }
    }

    /// Add a part
    #[must_use]
    pub fn with_part(mut self, part: PartInfo) -> Self {
        self.parts.push(part);
        self
    }

    /// Load a model from a TOML file
    ///
    /// A relative `model_dir` is resolved against the file's directory.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut model: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if model.model_dir.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            model.model_dir = base.join(&model.model_dir);
        }
        Ok(model)
    }
}

impl ModelProvider for StaticModel {
    fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn part(&self, id: &PartId) -> Option<PartInfo> {
        self.parts.iter().find(|p| &p.id == id).cloned()
    }

    fn parts(&self) -> Vec<PartId> {
        self.parts.iter().map(|p| p.id.clone()).collect()
    }

    fn solver_options(&self) -> SolverOptions {
        self.solver.clone()
    }

    fn stress_options(&self) -> StressOptions {
        self.stress.clone()
    }

    fn gage_options(&self) -> GageOptions {
        self.gage.clone()
    }

    fn modes_options(&self) -> ModesOptions {
        self.modes.clone()
    }

    fn strain_coat_options(&self) -> StrainCoatOptions {
        self.strain_coat.clone()
    }

    fn licenses(&self) -> LicenseFlags {
        self.licenses
    }

    fn stress_to_mpa_scale(&self) -> f64 {
        self.stress_to_mpa_scale
    }
}
