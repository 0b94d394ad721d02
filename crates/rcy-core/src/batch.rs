//! Batches of recovery stages
//!
//! A batch is what one user request expands to: one stage per scenario and
//! FE part. Stress and mode batches may export into one shared VTF file; the
//! builders give every stage its own block range in that file.

use crate::model::{ModesOptions, StressOptions};
use crate::stage::base::block_span;
use crate::stage::{
    FeFatigueStage, GageStage, ModesStage, RecoveryStage, SolverStage, StrainCoatStage,
    StressStage, VtfSlot,
};
use crate::types::{PartId, StageKind};
use rcy_archive::ScenarioId;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Ordered set of stages submitted together
#[derive(Debug, Default)]
pub struct RecoveryBatch {
    stages: Vec<Box<dyn RecoveryStage>>,
}

impl RecoveryBatch {
    /// Create an empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage
    pub fn push(&mut self, stage: Box<dyn RecoveryStage>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    /// Dynamics solver runs, one per scenario
    #[must_use]
    pub fn dynamics(scenarios: &[ScenarioId]) -> Self {
        let mut batch = Self::new();
        for &scenario in scenarios {
            batch.push(Box::new(SolverStage::new(scenario)));
        }
        batch
    }

    /// Stress recovery of every part in every scenario
    ///
    /// With VTF export, consecutive stages get block ranges spaced by the
    /// power of ten covering the number of time steps.
    #[must_use]
    pub fn stress_recovery(scenarios: &[ScenarioId], parts: &[PartId], options: &StressOptions) -> Self {
        let span = options
            .vtf
            .as_ref()
            .map(|vtf| block_span(options.window.step_count(vtf.expected_steps)));
        let output = options.vtf.as_ref().map(|v| (v.file.clone(), v.express));
        let mut slots = SlotAllocator::new(output, span, scenarios.len() * parts.len());

        let mut batch = Self::new();
        for &scenario in scenarios {
            for part in parts {
                let mut stage = StressStage::new(scenario, part.clone());
                if let Some(slot) = slots.next_slot() {
                    stage = stage.with_vtf(slot);
                }
                batch.push(Box::new(stage));
            }
        }
        batch
    }

    /// Mode shape expansion of every part in every scenario
    ///
    /// With VTF export, block ranges are spaced by the power of ten covering
    /// the number of selected modes.
    #[must_use]
    pub fn mode_expansion(scenarios: &[ScenarioId], parts: &[PartId], options: &ModesOptions) -> Self {
        let span = options.vtf.as_ref().map(|_| block_span(options.modes.len()));
        let output = options.vtf.as_ref().map(|v| (v.file.clone(), v.express));
        let mut slots = SlotAllocator::new(output, span, scenarios.len() * parts.len());

        let mut batch = Self::new();
        for &scenario in scenarios {
            for part in parts {
                let mut stage = ModesStage::new(scenario, part.clone());
                if let Some(slot) = slots.next_slot() {
                    stage = stage.with_vtf(slot);
                }
                batch.push(Box::new(stage));
            }
        }
        batch
    }

    /// Per-part stages without shared output
    ///
    /// # Returns
    /// `None` for [`StageKind::Solver`], which has no parts, and for the
    /// kinds with their own builder.
    #[must_use]
    pub fn per_part(kind: StageKind, scenarios: &[ScenarioId], parts: &[PartId]) -> Option<Self> {
        let mut batch = Self::new();
        for &scenario in scenarios {
            for part in parts {
                let stage: Box<dyn RecoveryStage> = match kind {
                    StageKind::Gage => Box::new(GageStage::new(scenario, part.clone())),
                    StageKind::StrainCoat => Box::new(StrainCoatStage::new(scenario, part.clone())),
                    StageKind::FeFatigue => Box::new(FeFatigueStage::new(scenario, part.clone())),
                    StageKind::Solver | StageKind::Stress | StageKind::Modes => return None,
                };
                batch.push(stage);
            }
        }
        Some(batch)
    }

    /// Number of stages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if the batch has no stages
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in submission order
    #[must_use]
    pub fn stages(&self) -> &[Box<dyn RecoveryStage>] {
        &self.stages
    }

    /// Scenarios the batch works on
    #[must_use]
    pub fn scenarios(&self) -> BTreeSet<ScenarioId> {
        self.stages.iter().map(|s| s.key().scenario).collect()
    }

    /// Output file shared by more than one stage, with the number of
    /// distinct parts writing it
    #[must_use]
    pub fn shared_output(&self) -> Option<(PathBuf, usize)> {
        let mut outputs: Vec<(&Path, BTreeSet<&PartId>)> = Vec::new();
        for stage in &self.stages {
            let (Some(file), Some(part)) = (stage.vtf_output(), stage.part()) else {
                continue;
            };
            match outputs.iter_mut().find(|(f, _)| *f == file) {
                Some((_, parts)) => {
                    parts.insert(part);
                }
                None => outputs.push((file, BTreeSet::from([part]))),
            }
        }
        outputs
            .into_iter()
            .find(|(_, parts)| parts.len() > 1)
            .map(|(file, parts)| (file.to_path_buf(), parts.len()))
    }

    /// Take the stages out of the batch
    #[must_use]
    pub fn into_stages(self) -> Vec<Box<dyn RecoveryStage>> {
        self.stages
    }
}

struct SlotAllocator {
    output: Option<(PathBuf, bool)>,
    span: usize,
    total: usize,
    issued: usize,
}

impl SlotAllocator {
    fn new(output: Option<(PathBuf, bool)>, span: Option<usize>, total: usize) -> Self {
        Self {
            output,
            span: span.unwrap_or(1),
            total,
            issued: 0,
        }
    }

    fn next_slot(&mut self) -> Option<VtfSlot> {
        let (file, express) = self.output.clone()?;
        let slot = VtfSlot {
            file,
            first_block: self.issued.saturating_mul(self.span),
            express,
            parts: (self.issued + 1 == self.total).then_some(self.total),
        };
        self.issued += 1;
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModeRequest, TimeWindow, VtfExport};

    fn parts(names: &[&str]) -> Vec<PartId> {
        names.iter().map(|n| PartId::new(*n)).collect()
    }

    fn vtf() -> VtfExport {
        VtfExport {
            file: PathBuf::from("results.vtf"),
            express: false,
            expected_steps: 100,
        }
    }

    #[test]
    fn stress_batch_shares_one_vtf_file() {
        let options = StressOptions {
            window: TimeWindow {
                start: 0.0,
                stop: 1.0,
                increment: 0.1,
                all_steps: false,
            },
            vtf: Some(vtf()),
            ..StressOptions::default()
        };
        let batch = RecoveryBatch::stress_recovery(
            &[ScenarioId::Master],
            &parts(&["a", "b", "c"]),
            &options,
        );
        assert_eq!(batch.len(), 3);
        let (file, count) = batch.shared_output().unwrap();
        assert_eq!(file, PathBuf::from("results.vtf"));
        assert_eq!(count, 3);
    }

    #[test]
    fn slot_allocator_marks_last_stage() {
        let mut slots = SlotAllocator::new(Some((PathBuf::from("x.vtf"), true)), Some(100), 3);
        let offsets: Vec<_> = std::iter::from_fn(|| slots.next_slot())
            .take(3)
            .map(|s| (s.first_block, s.parts))
            .collect();
        assert_eq!(offsets, vec![(0, None), (100, None), (200, Some(3))]);
    }

    #[test]
    fn huge_step_counts_do_not_overflow_offsets() {
        let options = StressOptions {
            window: TimeWindow {
                start: 0.0,
                stop: 1.0,
                increment: 1.0e-300,
                all_steps: false,
            },
            vtf: Some(vtf()),
            ..StressOptions::default()
        };
        let batch = RecoveryBatch::stress_recovery(
            &[ScenarioId::Master],
            &parts(&["a", "b", "c"]),
            &options,
        );
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn single_part_has_no_shared_output() {
        let options = ModesOptions {
            solve_eigenvalues: true,
            modes: vec![ModeRequest { time: 0.0, mode: 1 }],
            vtf: Some(vtf()),
            ..ModesOptions::default()
        };
        let batch = RecoveryBatch::mode_expansion(&[ScenarioId::Master], &parts(&["a"]), &options);
        assert!(batch.shared_output().is_none());
    }

    #[test]
    fn no_export_means_no_slots() {
        let batch = RecoveryBatch::stress_recovery(
            &[ScenarioId::Master, ScenarioId::Event(1)],
            &parts(&["a", "b"]),
            &StressOptions::default(),
        );
        assert_eq!(batch.len(), 4);
        assert!(batch.shared_output().is_none());
        assert_eq!(batch.scenarios().len(), 2);
    }

    #[test]
    fn per_part_rejects_kinds_with_builders() {
        assert!(RecoveryBatch::per_part(StageKind::Solver, &[ScenarioId::Master], &parts(&["a"])).is_none());
        let gages = RecoveryBatch::per_part(StageKind::Gage, &[ScenarioId::Master], &parts(&["a", "b"])).unwrap();
        assert_eq!(gages.len(), 2);
    }
}
