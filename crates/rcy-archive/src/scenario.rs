//! Scenario identity
//!
//! A model is simulated once as the master scenario and optionally as a set
//! of probabilistic events. Each scenario owns its own result archive.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Identifies the scenario a result archive or a process belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// The master scenario, stored directly under the archive root
    Master,
    /// A simulation event, stored under `event_NNN` below the archive root
    Event(u32),
}

impl ScenarioId {
    /// Check if this is the master scenario
    #[inline]
    #[must_use]
    pub fn is_master(self) -> bool {
        matches!(self, Self::Master)
    }

    /// Sub-directory of the archive root holding this scenario
    ///
    /// `None` for the master scenario.
    #[must_use]
    pub fn dir_name(self) -> Option<String> {
        match self {
            Self::Master => None,
            Self::Event(n) => Some(format!("event_{n:03}")),
        }
    }
}

impl Default for ScenarioId {
    fn default() -> Self {
        Self::Master
    }
}

impl Display for ScenarioId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Event(n) => write!(f, "event {n}"),
        }
    }
}

/// A scenario as tracked by the archive manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario identity
    pub id: ScenarioId,
    /// Probability weight used when aggregating results across events
    pub probability: f64,
    /// Whether the scenario's archive has been opened in this session
    pub touched: bool,
}

impl Scenario {
    /// Create an untouched scenario
    #[must_use]
    pub fn new(id: ScenarioId, probability: f64) -> Self {
        Self {
            id,
            probability,
            touched: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_dirs_are_zero_padded() {
        assert_eq!(ScenarioId::Event(3).dir_name().as_deref(), Some("event_003"));
        assert_eq!(ScenarioId::Event(1234).dir_name().as_deref(), Some("event_1234"));
        assert_eq!(ScenarioId::Master.dir_name(), None);
    }

    #[test]
    fn master_sorts_first() {
        let mut ids = vec![ScenarioId::Event(2), ScenarioId::Master, ScenarioId::Event(1)];
        ids.sort();
        assert_eq!(ids, vec![ScenarioId::Master, ScenarioId::Event(1), ScenarioId::Event(2)]);
    }
}
