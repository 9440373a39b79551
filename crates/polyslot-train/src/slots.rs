//! Slot registry
//!
//! A slot is one trainable unit together with its optimizer and the role that
//! decides where its labels come from. The registry builds every slot once
//! per phase and owns them exclusively; slot positions are stable for the
//! lifetime of the registry.

use crate::checkpoint::{slot_name, CheckpointManager};
use crate::config::RunConfig;
use anyhow::{Context, Result};
use polyslot_model::{AdamW, Device, Mode, Optimizer, TrainableUnit, UnitKind};
use std::fmt;
use tracing::info;

/// Where a slot's labels come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    /// The batch itself is the label
    Primary,
    /// The memory trace the primary slot kept for `layer`
    Memory { layer: usize },
    /// Pairs extracted for relation space `space`
    Relation { space: usize, paired: bool },
}

/// Group of slots whose metrics can be averaged together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    Sequence,
    Memory,
    Relation,
    PairedRelation,
}

impl SlotRole {
    pub fn family(&self) -> MetricFamily {
        match self {
            SlotRole::Primary => MetricFamily::Sequence,
            SlotRole::Memory { .. } => MetricFamily::Memory,
            SlotRole::Relation { paired: false, .. } => MetricFamily::Relation,
            SlotRole::Relation { paired: true, .. } => MetricFamily::PairedRelation,
        }
    }
}

impl fmt::Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotRole::Primary => write!(f, "primary"),
            SlotRole::Memory { layer } => write!(f, "memory layer {layer}"),
            SlotRole::Relation { space, paired } => {
                write!(f, "relation space {space}")?;
                if *paired {
                    write!(f, " (paired)")?;
                }
                Ok(())
            }
        }
    }
}

/// One trainable unit of a run
#[derive(Debug)]
pub struct Slot {
    /// Checkpoint key; `None` in single-slot runs
    pub index: Option<usize>,
    pub role: SlotRole,
    /// Output vocabulary of the unit
    pub vocab_size: usize,
    pub unit: Box<dyn TrainableUnit>,
    /// Present while training
    pub optimizer: Option<AdamW>,
    unsaved: bool,
}

impl Slot {
    pub fn name(&self) -> String {
        slot_name(self.index)
    }

    /// Apply one optimizer step with the unit's accumulated gradients
    ///
    /// # Errors
    /// Fails when the slot was built for evaluation and has no optimizer.
    pub fn apply_update(&mut self) -> Result<()> {
        let Some(optimizer) = &mut self.optimizer else {
            anyhow::bail!("{} has no optimizer", self.name());
        };
        optimizer.step(&mut self.unit.parameters_mut());
        self.unsaved = true;
        Ok(())
    }

    /// Whether the unit changed since it was created, loaded or last saved
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved
    }

    /// Overwrite this slot's checkpoint
    pub fn save(&mut self, checkpoints: &mut CheckpointManager) -> Result<()> {
        checkpoints.save(self.index, self.unit.as_ref())?;
        self.unsaved = false;
        Ok(())
    }
}

/// Owner of every slot of a phase
#[derive(Debug)]
pub struct SlotRegistry {
    slots: Vec<Slot>,
    device: Device,
}

/// Slot layout `(index, role, vocab_size)` for a configuration
pub fn slot_layout(config: &RunConfig) -> Vec<(Option<usize>, SlotRole, usize)> {
    let vocab = config.model.vocab_size;
    if !config.run.multi_slot {
        return vec![(None, SlotRole::Primary, vocab)];
    }
    match config.run.algorithm {
        UnitKind::EnsembleRelation => config
            .slots
            .relation_spaces
            .iter()
            .enumerate()
            .map(|(i, space)| {
                let role = SlotRole::Relation {
                    space: i,
                    paired: space.paired,
                };
                // Paired spaces also predict the relation token, offset past the vocabulary
                let slot_vocab = if space.paired { vocab * 2 } else { vocab };
                (Some(i), role, slot_vocab)
            })
            .collect(),
        _ => std::iter::once((Some(0), SlotRole::Primary, vocab))
            .chain((0..config.slots.memory_layers).map(|layer| {
                (Some(layer + 1), SlotRole::Memory { layer }, vocab)
            }))
            .collect(),
    }
}

impl SlotRegistry {
    /// Build every slot of a phase
    ///
    /// Training creates fresh units, or loads them when the run resumes.
    /// Evaluation loads every slot from its checkpoint, or the baseline unit
    /// when the baseline debug mode is on. Each unit is then moved to the
    /// device and put into the mode of the phase.
    ///
    /// # Errors
    /// Fails with [`CheckpointMissing`](crate::error::OrchestratorError::CheckpointMissing)
    /// when a required checkpoint does not exist.
    pub fn build(
        config: &RunConfig,
        checkpoints: &mut CheckpointManager,
        training: bool,
    ) -> Result<Self> {
        let device = Device::best_available();
        let resuming = training && config.continue_training();
        let mut slots = Vec::new();

        for (index, role, vocab_size) in slot_layout(config) {
            let (mut unit, unsaved) = if !training && config.debug.baseline_model {
                let path = config
                    .debug
                    .baseline_path
                    .as_deref()
                    .context("debug.baseline_path is not set")?;
                (checkpoints.load_baseline(path)?, false)
            } else if !training || resuming {
                (checkpoints.load(index, vocab_size)?, false)
            } else {
                let unit = checkpoints
                    .architecture()
                    .create(vocab_size)
                    .with_context(|| format!("Failed to create {}", slot_name(index)))?;
                (unit, true)
            };

            unit.to_device(device);
            unit.set_mode(if training { Mode::Train } else { Mode::Eval });

            let optimizer = training.then(|| AdamW::new(config.optimizer.clone()));
            info!(slot = %slot_name(index), %role, vocab_size, %device, "slot prepared");

            let mut slot = Slot {
                index,
                role,
                vocab_size,
                unit,
                optimizer,
                unsaved,
            };

            // Relation slots are written right away so a test-only run can consume them
            if training && config.run.multi_slot && config.run.algorithm == UnitKind::EnsembleRelation
            {
                slot.save(checkpoints)?;
            }
            slots.push(slot);
        }

        Ok(Self { slots, device })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn slot(&self, position: usize) -> &Slot {
        &self.slots[position]
    }

    pub fn slot_mut(&mut self, position: usize) -> &mut Slot {
        &mut self.slots[position]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }

    /// The slot whose memory trace feeds the memory-layer slots
    pub fn primary(&self) -> Option<&Slot> {
        self.slots.iter().find(|s| s.role == SlotRole::Primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RelationSpace, RunConfigFile};

    #[test]
    fn test_single_slot_layout() {
        let config = RunConfig::new(RunConfigFile::default()).unwrap();
        let layout = slot_layout(&config);
        assert_eq!(layout, vec![(None, SlotRole::Primary, 4096)]);
    }

    #[test]
    fn test_memory_layer_layout() {
        let mut file = RunConfigFile::default();
        file.run.multi_slot = true;
        file.slots.memory_layers = 2;
        let layout = slot_layout(&RunConfig::new(file).unwrap());
        assert_eq!(
            layout,
            vec![
                (Some(0), SlotRole::Primary, 4096),
                (Some(1), SlotRole::Memory { layer: 0 }, 4096),
                (Some(2), SlotRole::Memory { layer: 1 }, 4096),
            ]
        );
    }

    #[test]
    fn test_paired_relation_space_doubles_vocab() {
        let mut file = RunConfigFile::default();
        file.run.algorithm = UnitKind::EnsembleRelation;
        file.run.multi_slot = true;
        file.model.vocab_size = 100;
        file.slots.relation_spaces = vec![
            RelationSpace {
                name: "action".to_string(),
                delimiters: vec![7],
                paired: false,
            },
            RelationSpace {
                name: "property".to_string(),
                delimiters: vec![8],
                paired: true,
            },
        ];
        let layout = slot_layout(&RunConfig::new(file).unwrap());
        assert_eq!(layout[0].2, 100);
        assert_eq!(layout[1].2, 200);
        assert_eq!(layout[1].1.family(), MetricFamily::PairedRelation);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(SlotRole::Memory { layer: 3 }.to_string(), "memory layer 3");
        assert_eq!(
            SlotRole::Relation {
                space: 1,
                paired: true
            }
            .to_string(),
            "relation space 1 (paired)"
        );
    }
}
