//! Trainable-unit contract for polyslot
//!
//! This crate defines what the orchestrator needs from a trainable unit and
//! nothing more:
//! - [`TrainableUnit`]: forward propagation, backward, gradient reset, mode and device
//! - [`Architecture`]: the `create / load / save` capability for one unit kind
//! - [`RawBatch`] and [`Labels`]: what a unit consumes
//! - [`AdamW`]: the optimizer every slot owns while training
//!
//! A compact reference unit ([`BagUnit`]) implements all four unit kinds so the
//! orchestrator can run end to end without an external architecture.
//!
//! # Example
//!
//! ```no_run
//! use polyslot_model::{architecture, Device, Labels, RawBatch, TokenContext, UnitConfig, UnitKind};
//!
//! let arch = architecture(UnitConfig::for_kind(UnitKind::Autoregressive));
//! let mut unit = arch.create(512)?;
//!
//! let ctx = TokenContext::new(512);
//! let batch = RawBatch::new(vec![vec![5, 6, 7, 8]]);
//! let result = unit.propagate(&Device::Cpu, &ctx, &Labels::Sequence(batch))?;
//! assert!(result.loss.is_finite());
//!
//! arch.save(unit.as_ref(), std::path::Path::new("unit.safetensors"))?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod bag;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod init;
pub mod optim;
pub mod param;
pub mod stability;
pub mod unit;

/// Unit checkpoint persistence
///
/// One SafeTensors file per unit, with the unit configuration embedded in the
/// file header.
pub use checkpoint::{load_unit, save_unit, CHECKPOINT_VERSION};

/// Unit configuration and kind selector
pub use config::{UnitConfig, UnitKind};

/// Batches and label payloads
pub use batch::{Labels, MaskedToken, RawBatch, TokenPair};

/// Device, mode and token context passed to every propagate call
pub use device::{Device, Mode, TokenContext};

/// Optimizer
pub use optim::{AdamW, AdamWConfig, Optimizer};

/// Named trainable parameter
pub use param::Parameter;

/// Unit capability traits
pub use unit::{architecture, Architecture, Propagation, ReferenceArchitecture, TrainableUnit};

/// Reference unit
pub use bag::BagUnit;

/// Error type for unit-level failures
pub use unit::UnitError;

// Re-export common types for convenience
/// Result type alias for error handling
pub use anyhow::Result;
/// Error type alias for error handling
pub use anyhow::Error;
