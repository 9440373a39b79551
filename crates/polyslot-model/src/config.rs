//! Unit configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// The trainable unit variants the orchestrator can drive
///
/// Selected once per run by the `algorithm` option and resolved into an
/// [`Architecture`](crate::Architecture) before any slot is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Masked sequence model; the only kind fed masked batches
    #[default]
    Sequence,
    /// Recurrent next-token model with a decaying context state
    Recurrent,
    /// Autoregressive next-token model over a fixed context window
    Autoregressive,
    /// Relation model trained on (subject, object) pairs of one vector space
    EnsembleRelation,
}

impl UnitKind {
    /// Whether batches for this kind carry self-supervised masking
    pub fn uses_masking(self) -> bool {
        matches!(self, UnitKind::Sequence)
    }

    /// Stable name used in logs and checkpoint headers
    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::Sequence => "sequence",
            UnitKind::Recurrent => "recurrent",
            UnitKind::Autoregressive => "autoregressive",
            UnitKind::EnsembleRelation => "ensemble_relation",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a single trainable unit
///
/// Stored verbatim in every checkpoint header so a unit can be rebuilt
/// without the run configuration that created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Unit variant
    pub kind: UnitKind,
    /// Output vocabulary size (may be larger than the token vocabulary for paired relation spaces)
    pub vocab_size: usize,
    /// Embedding dimension
    pub embed_dim: usize,
    /// Context radius (sequence) or history length (recurrent, autoregressive)
    pub context_window: usize,
    /// Per-step decay of the recurrent context state
    pub decay: f32,
    /// Seed for parameter initialization
    pub seed: u64,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            kind: UnitKind::Sequence,
            vocab_size: 4096,
            embed_dim: 64,
            context_window: 4,
            decay: 0.7,
            seed: 42,
        }
    }
}

impl UnitConfig {
    /// Default configuration for a given kind
    pub fn for_kind(kind: UnitKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Copy of this configuration with another output vocabulary size
    pub fn with_vocab_size(&self, vocab_size: usize) -> Self {
        Self {
            vocab_size,
            ..self.clone()
        }
    }

    /// Validate the configuration before any parameter is allocated
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vocab_size == 0 {
            anyhow::bail!("vocab_size must be greater than zero");
        }
        if self.embed_dim == 0 {
            anyhow::bail!("embed_dim must be greater than zero");
        }
        if self.context_window == 0 {
            anyhow::bail!("context_window must be greater than zero");
        }
        if !(0.0..1.0).contains(&self.decay) {
            anyhow::bail!("decay must lie in [0, 1), got {}", self.decay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&UnitKind::EnsembleRelation).unwrap();
        assert_eq!(json, "\"ensemble_relation\"");
        let kind: UnitKind = serde_json::from_str("\"autoregressive\"").unwrap();
        assert_eq!(kind, UnitKind::Autoregressive);
    }

    #[test]
    fn test_only_sequence_masks() {
        assert!(UnitKind::Sequence.uses_masking());
        assert!(!UnitKind::Recurrent.uses_masking());
        assert!(!UnitKind::Autoregressive.uses_masking());
        assert!(!UnitKind::EnsembleRelation.uses_masking());
    }

    #[test]
    fn test_validate_rejects_bad_decay() {
        let config = UnitConfig {
            decay: 1.5,
            ..UnitConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(UnitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_with_vocab_size_keeps_other_fields() {
        let config = UnitConfig::for_kind(UnitKind::EnsembleRelation).with_vocab_size(10);
        assert_eq!(config.vocab_size, 10);
        assert_eq!(config.kind, UnitKind::EnsembleRelation);
        assert_eq!(config.embed_dim, UnitConfig::default().embed_dim);
    }
}
