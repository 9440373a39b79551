//! Run configuration
//!
//! A run is described by a JSON file deserialized into [`RunConfigFile`]. Every
//! section has serde defaults, so a file only needs the options it changes.
//! The file is validated once into a [`RunConfig`], which is immutable and
//! passed by reference to every component of the run.

use crate::error::OrchestratorError;
use anyhow::{Context, Result};
use polyslot_model::{AdamWConfig, TokenContext, UnitConfig, UnitKind};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::{Path, PathBuf};

/// Which phases a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Train only
    Train,
    /// Test only, from existing checkpoints
    Test,
    /// Train, then test the trained slots
    #[default]
    TrainTest,
}

impl Phase {
    pub fn trains(self) -> bool {
        matches!(self, Phase::Train | Phase::TrainTest)
    }

    pub fn tests(self) -> bool {
        matches!(self, Phase::Test | Phase::TrainTest)
    }
}

/// How per-slot labels are computed for multi-slot runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    /// Once per batch for all slots
    #[default]
    Vectorized,
    /// Per slot, on demand
    Lazy,
}

/// A relation vector space served by one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpace {
    /// Display name
    pub name: String,
    /// Token ids that mark a relation of this space
    pub delimiters: Vec<u32>,
    /// Whether the space also predicts the relation token itself; doubles the slot vocabulary
    #[serde(default)]
    pub paired: bool,
}

/// Complete run configuration loaded from file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfigFile {
    pub run: RunSection,
    pub data: DataSection,
    pub model: ModelSection,
    pub slots: SlotsSection,
    pub optimizer: AdamWConfig,
    pub checkpoint: CheckpointSection,
    pub metrics: MetricsSection,
    pub debug: DebugSection,
}

/// Algorithm, phase and resume markers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Unit kind driven by every slot
    pub algorithm: UnitKind,
    /// Phases to execute
    pub phase: Phase,
    /// One slot per role instead of a single slot
    pub multi_slot: bool,
    /// First epoch number; nonzero resumes training
    pub start_epoch: usize,
    /// First training file; nonzero resumes training
    pub start_file: usize,
    /// Number of epochs per phase
    pub epochs: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            algorithm: UnitKind::Sequence,
            phase: Phase::TrainTest,
            multi_slot: false,
            start_epoch: 0,
            start_file: 0,
            epochs: 1,
        }
    }
}

/// Data window and batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    /// Directory holding `*.tokens` shards
    pub dir: PathBuf,
    /// Whether batches are drawn from a file window; otherwise all shards are used
    pub windowed: bool,
    /// Total number of files in the dataset
    pub dataset_files: usize,
    /// Files requested per training epoch
    pub train_files: usize,
    /// Files requested per test epoch
    pub test_files: usize,
    /// Oversampling factor applied to the requested file count
    pub feed_multiplier: f64,
    /// Fraction of the dataset used for training when a validation split is reserved
    pub split_fraction: f64,
    /// Reserve the tail of the dataset for testing
    pub reserve_validation_set: bool,
    /// Rows per batch
    pub batch_size: usize,
    /// Tokens per row
    pub seq_len: usize,
    /// Fraction of positions masked for sequence units
    pub mask_fraction: f32,
    /// Seed for masking
    pub seed: u64,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            windowed: true,
            dataset_files: 100,
            train_files: 1,
            test_files: 1,
            feed_multiplier: 1.0,
            split_fraction: 0.9,
            reserve_validation_set: true,
            batch_size: 8,
            seq_len: 32,
            mask_fraction: 0.15,
            seed: 42,
        }
    }
}

/// Unit hyperparameters and special token ids
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Token vocabulary size
    pub vocab_size: usize,
    /// Embedding dimension
    pub embed_dim: usize,
    /// Context window of every unit
    pub context_window: usize,
    /// Decay of recurrent units
    pub decay: f32,
    /// Initialization seed
    pub seed: u64,
    /// Padding token id
    pub pad_id: u32,
    /// Mask token id
    pub mask_id: u32,
}

impl Default for ModelSection {
    fn default() -> Self {
        let unit = UnitConfig::default();
        Self {
            vocab_size: unit.vocab_size,
            embed_dim: unit.embed_dim,
            context_window: unit.context_window,
            decay: unit.decay,
            seed: unit.seed,
            pad_id: 0,
            mask_id: 1,
        }
    }
}

/// Multi-slot roles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsSection {
    /// Label strategy for relation slots
    pub label_mode: LabelMode,
    /// One slot per space (ensemble relation runs)
    pub relation_spaces: Vec<RelationSpace>,
    /// Number of memory-layer slots after the primary slot (sequence runs)
    pub memory_layers: usize,
}

/// Checkpoint location and cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// Directory holding one file per slot
    pub dir: PathBuf,
    /// Save every this many batches
    pub cadence_batches: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            cadence_batches: 100,
        }
    }
}

/// Metric display and reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    /// Running-average window in batches; 0 shows raw batch values
    pub running_average_window: usize,
    /// Where the test report is written
    pub report_dir: PathBuf,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            running_average_window: 10,
            report_dir: PathBuf::from("reports"),
        }
    }
}

/// Debug switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSection {
    /// Report slot 0 accuracy separately from the other slots
    pub bifurcated_metrics: bool,
    /// Test an external baseline unit instead of slot checkpoints
    pub baseline_model: bool,
    /// Checkpoint file of the baseline unit
    pub baseline_path: Option<PathBuf>,
    /// Dry run: training steps touch no unit and never checkpoint
    pub skip_training: bool,
}

impl RunConfigFile {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON configuration file
    ///
    /// # Returns
    /// Loaded configuration or error if file cannot be read or parsed
    ///
    /// # Example
    /// ```no_run
    /// use polyslot_train::config::RunConfigFile;
    /// use std::path::Path;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = RunConfigFile::from_file(Path::new("run.json"))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: RunConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }
}

/// Validated, immutable run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    file: RunConfigFile,
}

impl Deref for RunConfig {
    type Target = RunConfigFile;

    fn deref(&self) -> &RunConfigFile {
        &self.file
    }
}

impl RunConfig {
    /// Validate a configuration file
    ///
    /// # Errors
    /// [`OrchestratorError::Configuration`] for any incompatible combination of options
    pub fn new(file: RunConfigFile) -> Result<Self, OrchestratorError> {
        validate(&file)?;
        Ok(Self { file })
    }

    /// Whether training resumes from existing checkpoints
    pub fn continue_training(&self) -> bool {
        self.run.start_epoch > 0 || self.run.start_file > 0
    }

    /// Epoch numbers of one phase
    pub fn epochs(&self) -> std::ops::Range<usize> {
        self.run.start_epoch..self.run.start_epoch + self.run.epochs
    }

    /// Whether batches are masked for the configured algorithm
    pub fn uses_masking(&self) -> bool {
        self.run.algorithm.uses_masking()
    }

    /// Template every slot's unit is created from
    pub fn unit_template(&self) -> UnitConfig {
        UnitConfig {
            kind: self.run.algorithm,
            vocab_size: self.model.vocab_size,
            embed_dim: self.model.embed_dim,
            context_window: self.model.context_window,
            decay: self.model.decay,
            seed: self.model.seed,
        }
    }

    pub fn token_context(&self) -> TokenContext {
        TokenContext {
            vocab_size: self.model.vocab_size,
            pad_id: self.model.pad_id,
            mask_id: self.model.mask_id,
        }
    }

    /// Number of slots the registry will build
    pub fn slot_count(&self) -> usize {
        slot_count(&self.file)
    }
}

fn slot_count(file: &RunConfigFile) -> usize {
    if !file.run.multi_slot {
        return 1;
    }
    match file.run.algorithm {
        UnitKind::EnsembleRelation => file.slots.relation_spaces.len(),
        _ => 1 + file.slots.memory_layers,
    }
}

fn validate(file: &RunConfigFile) -> Result<(), OrchestratorError> {
    let err = |msg: &str| Err(OrchestratorError::configuration(msg));
    let run = &file.run;

    if file.debug.baseline_model {
        if run.phase.trains() {
            return err("the baseline model can only be tested; use phase \"test\"");
        }
        if run.algorithm != UnitKind::Sequence {
            return err("the baseline model requires the sequence algorithm");
        }
        if run.multi_slot {
            return err("the baseline model cannot be combined with multi-slot mode");
        }
        if file.debug.baseline_path.is_none() {
            return err("debug.baseline_path is required with the baseline model");
        }
    }

    if run.algorithm == UnitKind::EnsembleRelation && !run.multi_slot {
        return err("the ensemble relation algorithm needs multi-slot mode with relation spaces");
    }

    if run.multi_slot {
        match run.algorithm {
            UnitKind::Recurrent | UnitKind::Autoregressive => {
                return Err(OrchestratorError::configuration(format!(
                    "multi-slot mode is not available for the {} algorithm",
                    run.algorithm
                )));
            }
            UnitKind::EnsembleRelation if file.slots.relation_spaces.is_empty() => {
                return err("multi-slot ensemble relation runs need at least one relation space");
            }
            UnitKind::Sequence if file.slots.memory_layers == 0 => {
                return err("multi-slot sequence runs need at least one memory layer");
            }
            _ => {}
        }
    }

    if file.debug.bifurcated_metrics {
        if !run.multi_slot {
            return err("bifurcated metrics require multi-slot mode");
        }
        if slot_count(file) < 2 {
            return err("bifurcated metrics need at least two slots");
        }
        // Slot 0 is one family; every other slot must share the second one
        if run.algorithm == UnitKind::EnsembleRelation {
            let rest = &file.slots.relation_spaces[1..];
            if rest.iter().any(|s| s.paired != rest[0].paired) {
                return err(
                    "bifurcated metrics compare two metric families; slots after the first mix paired and unpaired spaces",
                );
            }
        }
    }

    let data = &file.data;
    if data.batch_size == 0 || data.seq_len == 0 {
        return err("data.batch_size and data.seq_len must be greater than zero");
    }
    if !(0.0..=1.0).contains(&data.split_fraction) {
        return err("data.split_fraction must lie in [0, 1]");
    }
    if !data.feed_multiplier.is_finite() || data.feed_multiplier < 0.0 {
        return err("data.feed_multiplier must be a non-negative number");
    }
    if !(0.0..=1.0).contains(&data.mask_fraction) {
        return err("data.mask_fraction must lie in [0, 1]");
    }
    if file.checkpoint.cadence_batches == 0 {
        return err("checkpoint.cadence_batches must be greater than zero");
    }

    let model = &file.model;
    let vocab = model.vocab_size;
    if model.pad_id as usize >= vocab || model.mask_id as usize >= vocab {
        return err("model.pad_id and model.mask_id must be inside the vocabulary");
    }
    if model.pad_id == model.mask_id {
        return err("model.pad_id and model.mask_id must differ");
    }
    for space in &file.slots.relation_spaces {
        if space.delimiters.is_empty() {
            return Err(OrchestratorError::configuration(format!(
                "relation space '{}' has no delimiter tokens",
                space.name
            )));
        }
        if let Some(d) = space
            .delimiters
            .iter()
            .find(|&&d| d as usize >= vocab || d == model.pad_id || d == model.mask_id)
        {
            return Err(OrchestratorError::configuration(format!(
                "relation space '{}' uses invalid delimiter token {}",
                space.name, d
            )));
        }
    }

    let template = UnitConfig {
        kind: run.algorithm,
        vocab_size: vocab,
        embed_dim: model.embed_dim,
        context_window: model.context_window,
        decay: model.decay,
        seed: model.seed,
    };
    template
        .validate()
        .map_err(|e| OrchestratorError::configuration(format!("model: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn relation_file(spaces: Vec<RelationSpace>) -> RunConfigFile {
        let mut file = RunConfigFile::default();
        file.run.algorithm = UnitKind::EnsembleRelation;
        file.run.multi_slot = true;
        file.slots.relation_spaces = spaces;
        file
    }

    fn space(name: &str, delimiter: u32, paired: bool) -> RelationSpace {
        RelationSpace {
            name: name.to_string(),
            delimiters: vec![delimiter],
            paired,
        }
    }

    fn config_error(file: RunConfigFile) -> String {
        match RunConfig::new(file) {
            Err(OrchestratorError::Configuration(msg)) => msg,
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_config_default_is_valid() {
        let config = RunConfig::new(RunConfigFile::default()).unwrap();
        assert_eq!(config.run.algorithm, UnitKind::Sequence);
        assert_eq!(config.slot_count(), 1);
        assert!(!config.continue_training());
        assert!(config.uses_masking());
    }

    #[test]
    fn test_config_from_file() {
        let config_json = r#"{
            "run": { "algorithm": "ensemble_relation", "phase": "train", "multi_slot": true },
            "data": { "batch_size": 4, "seq_len": 16 },
            "slots": {
                "label_mode": "lazy",
                "relation_spaces": [
                    { "name": "action", "delimiters": [7] },
                    { "name": "condition", "delimiters": [8, 9], "paired": true }
                ]
            },
            "optimizer": { "learning_rate": 0.0002 },
            "checkpoint": { "cadence_batches": 25 }
        }"#;

        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(config_json.as_bytes()).expect("Failed to write config");
        file.flush().expect("Failed to flush");

        let loaded = RunConfigFile::from_file(file.path()).expect("Failed to load config");
        let config = RunConfig::new(loaded).expect("config should validate");

        assert_eq!(config.run.phase, Phase::Train);
        assert_eq!(config.slots.label_mode, LabelMode::Lazy);
        assert_eq!(config.slot_count(), 2);
        assert!(config.slots.relation_spaces[1].paired);
        assert_eq!(config.optimizer.learning_rate, 0.0002);
        assert_eq!(config.optimizer.beta1, 0.9);
        assert_eq!(config.checkpoint.cadence_batches, 25);
        assert_eq!(config.data.seq_len, 16);
        assert_eq!(config.data.split_fraction, 0.9);
    }

    #[test]
    fn test_continue_training_markers() {
        let mut file = RunConfigFile::default();
        file.run.start_file = 3;
        assert!(RunConfig::new(file.clone()).unwrap().continue_training());

        file.run.start_file = 0;
        file.run.start_epoch = 1;
        let config = RunConfig::new(file).unwrap();
        assert!(config.continue_training());
        assert_eq!(config.epochs(), 1..2);
    }

    #[test]
    fn test_baseline_rejects_train_phase() {
        let mut file = RunConfigFile::default();
        file.debug.baseline_model = true;
        file.debug.baseline_path = Some(PathBuf::from("baseline.safetensors"));
        file.run.phase = Phase::TrainTest;
        assert!(config_error(file.clone()).contains("baseline"));

        file.run.phase = Phase::Test;
        assert!(RunConfig::new(file).is_ok());
    }

    #[test]
    fn test_baseline_rejects_other_algorithms_and_multi_slot() {
        let mut file = RunConfigFile::default();
        file.debug.baseline_model = true;
        file.debug.baseline_path = Some(PathBuf::from("baseline.safetensors"));
        file.run.phase = Phase::Test;
        file.run.algorithm = UnitKind::Recurrent;
        config_error(file.clone());

        file.run.algorithm = UnitKind::Sequence;
        file.run.multi_slot = true;
        file.slots.memory_layers = 2;
        config_error(file);
    }

    #[test]
    fn test_multi_slot_needs_roles() {
        config_error(relation_file(Vec::new()));

        let mut file = RunConfigFile::default();
        file.run.multi_slot = true;
        config_error(file.clone());
        file.slots.memory_layers = 2;
        assert_eq!(RunConfig::new(file).unwrap().slot_count(), 3);

        let mut file = RunConfigFile::default();
        file.run.algorithm = UnitKind::Autoregressive;
        file.run.multi_slot = true;
        config_error(file);

        let mut file = relation_file(vec![space("a", 7, false)]);
        file.run.multi_slot = false;
        config_error(file);
    }

    #[test]
    fn test_bifurcated_restrictions() {
        let mut file = RunConfigFile::default();
        file.debug.bifurcated_metrics = true;
        config_error(file);

        let mut file = relation_file(vec![space("a", 7, false)]);
        file.debug.bifurcated_metrics = true;
        config_error(file);

        let mut file = relation_file(vec![
            space("a", 7, true),
            space("b", 8, false),
            space("c", 9, true),
        ]);
        file.debug.bifurcated_metrics = true;
        assert!(config_error(file.clone()).contains("metric families"));

        file.slots.relation_spaces[2].paired = false;
        assert!(RunConfig::new(file).is_ok());
    }

    #[test]
    fn test_numeric_ranges() {
        let mut file = RunConfigFile::default();
        file.checkpoint.cadence_batches = 0;
        config_error(file);

        let mut file = RunConfigFile::default();
        file.data.split_fraction = 1.5;
        config_error(file);

        let mut file = RunConfigFile::default();
        file.data.feed_multiplier = -1.0;
        config_error(file);

        let mut file = RunConfigFile::default();
        file.data.batch_size = 0;
        config_error(file);
    }

    #[test]
    fn test_delimiters_must_be_ordinary_tokens() {
        let mut file = relation_file(vec![space("a", 1, false)]);
        assert!(config_error(file.clone()).contains("delimiter"));
        file.slots.relation_spaces[0].delimiters = vec![100_000];
        config_error(file);
    }
}
