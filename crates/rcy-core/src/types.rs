//! Core types for recovery orchestration
//!
//! Stage kinds with their executables and sub-tasks, readiness verdicts,
//! stage keys and tickets.

use rcy_archive::ScenarioId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use ulid::Ulid;

/// Kind of a recovery stage, one per solver executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Dynamics solver producing primary time histories
    Solver,
    /// Stress recovery
    Stress,
    /// Strain gage recovery
    Gage,
    /// Mode shape expansion
    Modes,
    /// Strain coat recovery producing damage files
    StrainCoat,
    /// FE fatigue evaluation of damage files
    FeFatigue,
}

impl StageKind {
    /// Every stage kind, in dependency order
    pub const ALL: [StageKind; 6] = [
        Self::Solver,
        Self::Stress,
        Self::Gage,
        Self::Modes,
        Self::StrainCoat,
        Self::FeFatigue,
    ];

    /// Executable name
    #[must_use]
    pub fn solver_name(self) -> &'static str {
        match self {
            Self::Solver => "fedem_solver",
            Self::Stress => "fedem_stress",
            Self::Gage => "fedem_gage",
            Self::Modes => "fedem_modes",
            Self::StrainCoat => "fedem_fpp",
            Self::FeFatigue => "ncl",
        }
    }

    /// Sub-task the stage writes to, directly below the root task
    #[must_use]
    pub fn sub_task(self) -> &'static str {
        match self {
            Self::Solver => "timehist_prim",
            Self::Stress => "timehist_rcy",
            Self::Gage => "timehist_gage_rcy",
            Self::Modes => "eigval_rcy",
            Self::StrainCoat | Self::FeFatigue => "summary_rcy",
        }
    }

    /// Stage whose output this stage consumes
    #[must_use]
    pub fn producer(self) -> Option<StageKind> {
        match self {
            Self::Solver => None,
            Self::Stress | Self::Gage | Self::Modes | Self::StrainCoat => Some(Self::Solver),
            Self::FeFatigue => Some(Self::StrainCoat),
        }
    }

    /// Check if the stage works on one FE part
    #[inline]
    #[must_use]
    pub fn is_per_part(self) -> bool {
        !matches!(self, Self::Solver)
    }

    /// Human readable label used in progress messages
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Solver => "Dynamics Solver",
            Self::Stress => "Stress",
            Self::Gage => "Strain Gages",
            Self::Modes => "Mode Shapes",
            Self::StrainCoat => "Strain Coat",
            Self::FeFatigue => "FE Fatigue",
        }
    }
}

impl Display for StageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.solver_name())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "solver" | "fedem_solver" => Ok(Self::Solver),
            "stress" | "fedem_stress" => Ok(Self::Stress),
            "gage" | "fedem_gage" => Ok(Self::Gage),
            "modes" | "fedem_modes" => Ok(Self::Modes),
            "strain-coat" | "strain_coat" | "fedem_fpp" => Ok(Self::StrainCoat),
            "fe-fatigue" | "fe_fatigue" | "ncl" => Ok(Self::FeFatigue),
            other => Err(format!("unknown stage kind '{other}'")),
        }
    }
}

/// Readiness verdict of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// All inputs present, the process may start
    ReadyToRun,
    /// A producing stage is still running; check again later
    PendingButWait,
    /// The stage can never run as requested
    NotExecutable(String),
    /// Nothing to do, e.g. the part has no strain rosettes
    ResultsOk,
}

impl StageStatus {
    /// Build a not-executable verdict
    #[inline]
    pub fn not_executable(reason: impl Into<String>) -> Self {
        Self::NotExecutable(reason.into())
    }

    /// Check if the verdict is final
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotExecutable(_) | Self::ResultsOk)
    }
}

/// Name of an FE part as known to the model
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartId(pub String);

impl PartId {
    /// Create a part id
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Part name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PartId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a stage: which solver, for which scenario and part
///
/// Two stages with the same key would write into the same run directory;
/// the process group manager runs at most one of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageKey {
    /// Scenario the stage works on
    pub scenario: ScenarioId,
    /// Solver kind
    pub kind: StageKind,
    /// FE part, for per-part stages
    pub part: Option<PartId>,
}

impl StageKey {
    /// Key of a stage without a part
    #[must_use]
    pub fn new(scenario: ScenarioId, kind: StageKind) -> Self {
        Self {
            scenario,
            kind,
            part: None,
        }
    }

    /// Key of a per-part stage
    #[must_use]
    pub fn for_part(scenario: ScenarioId, kind: StageKind, part: PartId) -> Self {
        Self {
            scenario,
            kind,
            part: Some(part),
        }
    }
}

impl Display for StageKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.part {
            Some(part) => write!(f, "{}@{}/{}", self.kind, self.scenario, part),
            None => write!(f, "{}@{}", self.kind, self.scenario),
        }
    }
}

/// Handle returned for every submitted stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageTicket(pub Ulid);

impl StageTicket {
    /// Create a new unique ticket
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for StageTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StageTicket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_kinds_parse_from_cli_names() {
        for kind in StageKind::ALL {
            assert_eq!(kind.solver_name().parse::<StageKind>(), Ok(kind));
        }
        assert_eq!("strain-coat".parse::<StageKind>(), Ok(StageKind::StrainCoat));
        assert!("welding".parse::<StageKind>().is_err());
    }

    #[test]
    fn fatigue_depends_on_strain_coat() {
        assert_eq!(StageKind::FeFatigue.producer(), Some(StageKind::StrainCoat));
        assert_eq!(StageKind::Gage.producer(), Some(StageKind::Solver));
        assert_eq!(StageKind::Solver.producer(), None);
    }

    #[test]
    fn stage_key_display() {
        let key = StageKey::for_part(ScenarioId::Event(2), StageKind::Gage, PartId::new("part1"));
        assert_eq!(key.to_string(), "fedem_gage@event 2/part1");
        assert_eq!(
            StageKey::new(ScenarioId::Master, StageKind::Solver).to_string(),
            "fedem_solver@master"
        );
    }
}
