//! Multi-slot training and testing orchestrator
//!
//! A run trains and/or tests one or more slots, each holding a trainable unit
//! from `polyslot-model`. Per batch, every slot receives its own labels from a
//! label dispatcher, steps in slot order, and reports `(loss, accuracy)` to a
//! metric aggregator. Slots are checkpointed on a batch cadence.

pub mod checkpoint;
pub mod config;
pub mod dataloader;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod report;
pub mod slots;
pub mod step;
pub mod train;
pub mod window;

pub use config::{Phase, RunConfig, RunConfigFile};
pub use error::OrchestratorError;
pub use train::{run, RunOutcome};
