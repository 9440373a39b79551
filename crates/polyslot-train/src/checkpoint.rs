//! Slot checkpoints
//!
//! One file per slot under the checkpoint directory: `unit.safetensors` in
//! single-slot runs, `unit_{index}.safetensors` otherwise. Saves overwrite the
//! slot's file in place and no history or manifest is kept.

use crate::error::OrchestratorError;
use anyhow::{Context, Result};
use polyslot_model::{Architecture, TrainableUnit, UnitError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Batch-count save cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointCadence {
    every: usize,
}

impl CheckpointCadence {
    /// # Panics
    /// Panics if `every` is zero; [`RunConfig`](crate::config::RunConfig) rejects that value.
    pub fn new(every: usize) -> Self {
        assert!(every > 0, "checkpoint cadence must be positive");
        Self { every }
    }

    /// Whether the slot is saved right after the step of `batch_index`
    pub fn should_save(&self, batch_index: usize) -> bool {
        batch_index % self.every == 0
    }

    /// Whether a loop of `batches` batches ended after its last cadence save
    pub fn needs_final_save(&self, batches: usize) -> bool {
        batches > 0 && !self.should_save(batches - 1)
    }
}

/// Human-readable name of a slot for diagnostics
pub fn slot_name(index: Option<usize>) -> String {
    match index {
        Some(i) => format!("slot {i}"),
        None => "the model".to_string(),
    }
}

/// Persists and restores slot units
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    architecture: Arc<dyn Architecture>,
    saves: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, architecture: Arc<dyn Architecture>) -> Self {
        Self {
            dir: dir.into(),
            architecture,
            saves: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn architecture(&self) -> &Arc<dyn Architecture> {
        &self.architecture
    }

    /// Checkpoint location of a slot
    pub fn path_for(&self, index: Option<usize>) -> PathBuf {
        match index {
            Some(i) => self.dir.join(format!("unit_{i}.safetensors")),
            None => self.dir.join("unit.safetensors"),
        }
    }

    pub fn exists(&self, index: Option<usize>) -> bool {
        self.path_for(index).is_file()
    }

    /// Overwrite the checkpoint of a slot
    pub fn save(&mut self, index: Option<usize>, unit: &dyn TrainableUnit) -> Result<()> {
        let path = self.path_for(index);
        self.architecture
            .save(unit, &path)
            .with_context(|| format!("Failed to save checkpoint of {}", slot_name(index)))?;
        self.saves += 1;
        debug!(slot = %slot_name(index), path = %path.display(), "checkpoint saved");
        Ok(())
    }

    /// Load the checkpoint of a slot
    ///
    /// # Arguments
    /// * `index` - Slot index, `None` in single-slot runs
    /// * `vocab_size` - Output vocabulary the slot is expected to have
    ///
    /// # Errors
    /// [`OrchestratorError::CheckpointMissing`] if the file does not exist and
    /// [`OrchestratorError::IncompatibleCheckpoint`] if it holds another unit kind
    /// or vocabulary.
    pub fn load(&self, index: Option<usize>, vocab_size: usize) -> Result<Box<dyn TrainableUnit>> {
        let path = self.path_for(index);
        if !path.is_file() {
            return Err(OrchestratorError::CheckpointMissing {
                slot: slot_name(index),
                path,
            }
            .into());
        }

        let unit = self.load_path(&path, &slot_name(index))?;
        if unit.config().vocab_size != vocab_size {
            return Err(OrchestratorError::IncompatibleCheckpoint {
                slot: slot_name(index),
                path,
                reason: format!(
                    "vocabulary of {} where {} was expected",
                    unit.config().vocab_size,
                    vocab_size
                ),
            }
            .into());
        }
        info!(slot = %slot_name(index), path = %path.display(), "checkpoint loaded");
        Ok(unit)
    }

    /// Load an externally supplied baseline unit, bypassing slot checkpoints
    pub fn load_baseline(&self, path: &Path) -> Result<Box<dyn TrainableUnit>> {
        if !path.is_file() {
            return Err(OrchestratorError::CheckpointMissing {
                slot: "the baseline model".to_string(),
                path: path.to_path_buf(),
            }
            .into());
        }
        let unit = self.load_path(path, "the baseline model")?;
        info!(path = %path.display(), "baseline model loaded");
        Ok(unit)
    }

    fn load_path(&self, path: &Path, slot: &str) -> Result<Box<dyn TrainableUnit>> {
        self.architecture.load(path).map_err(|e| {
            let wrong_kind = matches!(
                e.downcast_ref::<UnitError>(),
                Some(UnitError::KindMismatch { .. })
            );
            if wrong_kind {
                OrchestratorError::IncompatibleCheckpoint {
                    slot: slot.to_string(),
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
                .into()
            } else {
                e.context(format!("Failed to load checkpoint of {slot}"))
            }
        })
    }

    /// Number of saves performed through this manager
    pub fn save_count(&self) -> usize {
        self.saves
    }
}
