//! Per-slot train and eval steps

use crate::checkpoint::{CheckpointCadence, CheckpointManager};
use crate::config::RunConfig;
use crate::labels::LabelSet;
use crate::slots::Slot;
use anyhow::Result;
use polyslot_model::{Device, TokenContext};
use tracing::trace;

/// What a step did with a slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// No labels for this batch; nothing was touched
    Skipped,
    /// Forward pass ran but produced nothing to fit, or training is a dry run
    Degenerate { loss: f32, accuracy: f32 },
    /// Forward pass ran; in training the optimizer was stepped
    Applied { loss: f32, accuracy: f32 },
}

impl StepOutcome {
    /// `(loss, accuracy)` as seen by the aggregator; `None` for skipped slots
    pub fn metrics(&self) -> Option<(f32, f32)> {
        match *self {
            StepOutcome::Skipped => None,
            StepOutcome::Degenerate { loss, accuracy } | StepOutcome::Applied { loss, accuracy } => {
                Some((loss, accuracy))
            }
        }
    }
}

/// Runs the step of one slot on one batch
#[derive(Debug, Clone)]
pub struct StepExecutor {
    device: Device,
    tokens: TokenContext,
    cadence: CheckpointCadence,
    dry_run: bool,
}

impl StepExecutor {
    pub fn new(config: &RunConfig, device: Device) -> Self {
        Self {
            device,
            tokens: config.token_context(),
            cadence: CheckpointCadence::new(config.checkpoint.cadence_batches),
            dry_run: config.debug.skip_training,
        }
    }

    pub fn cadence(&self) -> CheckpointCadence {
        self.cadence
    }

    /// Train `slot` on one batch
    ///
    /// Gradients are reset first. A slot without labels is skipped and never
    /// checkpointed. A degenerate forward pass skips backward and the
    /// optimizer, but still takes part in the checkpoint cadence. Failures of
    /// the unit propagate.
    ///
    /// # Arguments
    /// * `slot` - Slot to step
    /// * `labels` - Labels the dispatcher produced for the slot
    /// * `batch_index` - Index of the batch within the epoch, drives the save cadence
    /// * `checkpoints` - Where cadence saves go
    pub fn train_step(
        &self,
        slot: &mut Slot,
        labels: &LabelSet,
        batch_index: usize,
        checkpoints: &mut CheckpointManager,
    ) -> Result<StepOutcome> {
        if self.dry_run {
            return Ok(StepOutcome::Degenerate {
                loss: 0.0,
                accuracy: 0.0,
            });
        }

        slot.unit.zero_grad();
        let Some(labels) = &labels.labels else {
            trace!(slot = %slot.name(), batch_index, "no labels, slot skipped");
            return Ok(StepOutcome::Skipped);
        };

        let propagation = slot.unit.propagate(&self.device, &self.tokens, labels)?;
        let outcome = if propagation.result {
            slot.unit.backward()?;
            slot.apply_update()?;
            StepOutcome::Applied {
                loss: propagation.loss,
                accuracy: propagation.accuracy,
            }
        } else {
            trace!(slot = %slot.name(), batch_index, "degenerate forward pass");
            StepOutcome::Degenerate {
                loss: propagation.loss,
                accuracy: propagation.accuracy,
            }
        };

        if self.cadence.should_save(batch_index) {
            slot.save(checkpoints)?;
        }
        Ok(outcome)
    }

    /// Evaluate `slot` on one batch: forward pass only
    pub fn eval_step(&self, slot: &mut Slot, labels: &LabelSet) -> Result<StepOutcome> {
        let Some(labels) = &labels.labels else {
            return Ok(StepOutcome::Skipped);
        };
        let propagation = slot.unit.propagate(&self.device, &self.tokens, labels)?;
        Ok(if propagation.result {
            StepOutcome::Applied {
                loss: propagation.loss,
                accuracy: propagation.accuracy,
            }
        } else {
            StepOutcome::Degenerate {
                loss: propagation.loss,
                accuracy: propagation.accuracy,
            }
        })
    }
}
