//! Fatal run errors
//!
//! Only conditions that stop a run before or while slots are built live here.
//! A missing label or a degenerate forward pass is a [`StepOutcome`](crate::step::StepOutcome),
//! and failures inside a unit propagate as plain `anyhow` errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Incompatible option combination, detected before any work begins
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Resume or evaluation needs a checkpoint that does not exist
    #[error("no checkpoint for {slot} at {}", path.display())]
    CheckpointMissing { slot: String, path: PathBuf },

    /// A checkpoint exists but was written for another unit or vocabulary
    #[error("checkpoint {} does not match {slot}: {reason}", path.display())]
    IncompatibleCheckpoint {
        slot: String,
        path: PathBuf,
        reason: String,
    },
}

impl OrchestratorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::CheckpointMissing { .. } | Self::IncompatibleCheckpoint { .. } => 3,
        }
    }
}
