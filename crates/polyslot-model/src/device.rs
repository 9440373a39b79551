//! Compute device, unit mode and token context

use std::fmt;

/// Compute device a unit's parameters live on
///
/// The reference units run on the host; the enum exists so that the
/// orchestrator moves every slot explicitly, the same way it would for an
/// accelerator-backed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
}

impl Device {
    /// Best device available to this process
    pub fn best_available() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

/// Train or eval mode of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// Token-level facts a unit needs beyond the batch itself
///
/// Stands in for the tokenizer: units only need the vocabulary size and the
/// ids of the special tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenContext {
    /// Token vocabulary size
    pub vocab_size: usize,
    /// Padding token id, never used as a target
    pub pad_id: u32,
    /// Mask token id, written over masked positions
    pub mask_id: u32,
}

impl TokenContext {
    /// Context with the conventional special ids (`0` = pad, `1` = mask)
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            pad_id: 0,
            mask_id: 1,
        }
    }

    /// Whether `id` is a special token that never forms part of a context or target
    pub fn is_special(&self, id: u32) -> bool {
        id == self.pad_id || id == self.mask_id
    }
}
