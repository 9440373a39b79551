//! Trainable unit and architecture capabilities
//!
//! The orchestrator never looks inside a unit. It drives every slot through
//! [`TrainableUnit`] and obtains units through an [`Architecture`], which is
//! resolved once per run from the configured [`UnitKind`].

use crate::{checkpoint, BagUnit, Device, Labels, Mode, Parameter, RawBatch, TokenContext};
use crate::{UnitConfig, UnitKind};
use anyhow::Result;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Unit-level failures
///
/// These are compute failures from the orchestrator's point of view: they are
/// never absorbed by a step and terminate the run.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("token id {token} is outside the unit vocabulary of {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    #[error("{kind} unit cannot train on {found} labels")]
    LabelsMismatch { kind: UnitKind, found: &'static str },

    #[error("expected a {expected} unit, found {found}")]
    KindMismatch { expected: UnitKind, found: UnitKind },

    #[error("unit lives on {unit} but was asked to run on {requested}")]
    DeviceMismatch { unit: Device, requested: Device },

    #[error("backward called without a pending forward pass")]
    NoPendingGradients,

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("corrupt unit state: {0}")]
    CorruptState(String),
}

/// Outcome of one forward pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Propagation {
    pub loss: f32,
    pub accuracy: f32,
    /// `false` when nothing survived the unit's internal filtering; the
    /// caller must not run backward for this pass
    pub result: bool,
}

impl Propagation {
    /// Neutral outcome of a forward pass with nothing to fit
    pub fn degenerate() -> Self {
        Self {
            loss: 0.0,
            accuracy: 0.0,
            result: false,
        }
    }
}

/// A unit the orchestrator can train, evaluate and checkpoint
pub trait TrainableUnit: fmt::Debug + Send {
    fn kind(&self) -> UnitKind;

    fn config(&self) -> &UnitConfig;

    /// Forward pass over `labels`, returning loss and accuracy
    ///
    /// In train mode the gradients of this pass are kept pending until
    /// [`backward`](TrainableUnit::backward) is called.
    fn propagate(
        &mut self,
        device: &Device,
        ctx: &TokenContext,
        labels: &Labels,
    ) -> Result<Propagation>;

    /// Accumulate the pending gradients of the last forward pass
    fn backward(&mut self) -> Result<()>;

    /// Reset accumulated gradients and drop any pending forward pass
    fn zero_grad(&mut self);

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn set_mode(&mut self, mode: Mode);

    fn mode(&self) -> Mode;

    fn to_device(&mut self, device: Device);

    fn device(&self) -> Device;

    /// Tokens this unit kept from its last forward pass for the memory layer `layer`
    fn memory_trace(&self, _layer: usize) -> Option<RawBatch> {
        None
    }
}

/// Create, load and save capability for one unit kind
pub trait Architecture: fmt::Debug + Send + Sync {
    fn kind(&self) -> UnitKind;

    /// Fresh unit with the given output vocabulary size
    fn create(&self, vocab_size: usize) -> Result<Box<dyn TrainableUnit>>;

    /// Load a unit previously written by [`save`](Architecture::save)
    fn load(&self, path: &Path) -> Result<Box<dyn TrainableUnit>>;

    /// Persist `unit` at `path`, replacing any previous file
    fn save(&self, unit: &dyn TrainableUnit, path: &Path) -> Result<()>;
}

/// Architecture backed by the reference [`BagUnit`]
#[derive(Debug, Clone)]
pub struct ReferenceArchitecture {
    template: UnitConfig,
}

impl ReferenceArchitecture {
    pub fn new(template: UnitConfig) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &UnitConfig {
        &self.template
    }
}

impl Architecture for ReferenceArchitecture {
    fn kind(&self) -> UnitKind {
        self.template.kind
    }

    fn create(&self, vocab_size: usize) -> Result<Box<dyn TrainableUnit>> {
        let unit = BagUnit::new(self.template.with_vocab_size(vocab_size))?;
        Ok(Box::new(unit))
    }

    fn load(&self, path: &Path) -> Result<Box<dyn TrainableUnit>> {
        let unit = checkpoint::load_unit(path)?;
        if unit.kind() != self.template.kind {
            return Err(UnitError::KindMismatch {
                expected: self.template.kind,
                found: unit.kind(),
            }
            .into());
        }
        Ok(Box::new(unit))
    }

    fn save(&self, unit: &dyn TrainableUnit, path: &Path) -> Result<()> {
        checkpoint::save_unit(unit, path)
    }
}

/// Resolve the architecture for a unit template
pub fn architecture(template: UnitConfig) -> Arc<dyn Architecture> {
    Arc::new(ReferenceArchitecture::new(template))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_uses_requested_vocab() {
        let arch = architecture(UnitConfig::for_kind(UnitKind::EnsembleRelation));
        let unit = arch.create(64).unwrap();
        assert_eq!(unit.config().vocab_size, 64);
        assert_eq!(unit.kind(), UnitKind::EnsembleRelation);
    }

    #[test]
    fn test_load_rejects_other_kind() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unit.safetensors");

        let recurrent = architecture(UnitConfig {
            embed_dim: 8,
            ..UnitConfig::for_kind(UnitKind::Recurrent)
        });
        let unit = recurrent.create(32).unwrap();
        recurrent.save(unit.as_ref(), &path).unwrap();

        let sequence = architecture(UnitConfig::for_kind(UnitKind::Sequence));
        let err = sequence.load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UnitError>(),
            Some(UnitError::KindMismatch { .. })
        ));
    }
}
