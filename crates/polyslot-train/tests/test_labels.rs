//! Integration tests for label dispatch against a built registry

use polyslot_model::{architecture, Device, Labels, RawBatch, UnitKind};
use polyslot_train::checkpoint::CheckpointManager;
use polyslot_train::config::{LabelMode, RelationSpace, RunConfig, RunConfigFile};
use polyslot_train::labels::{dispatcher_for, LabelDispatcher};
use polyslot_train::slots::SlotRegistry;
use proptest::prelude::*;
use tempfile::TempDir;

fn relation_config(label_mode: LabelMode) -> RunConfig {
    let mut file = RunConfigFile::default();
    file.run.algorithm = UnitKind::EnsembleRelation;
    file.run.multi_slot = true;
    file.model.vocab_size = 24;
    file.model.embed_dim = 4;
    file.slots.label_mode = label_mode;
    file.slots.relation_spaces = vec![
        RelationSpace {
            name: "action".to_string(),
            delimiters: vec![20],
            paired: false,
        },
        RelationSpace {
            name: "condition".to_string(),
            delimiters: vec![21, 22],
            paired: true,
        },
    ];
    RunConfig::new(file).unwrap()
}

fn registry(config: &RunConfig, dir: &std::path::Path) -> SlotRegistry {
    let mut checkpoints = CheckpointManager::new(dir, architecture(config.unit_template()));
    SlotRegistry::build(config, &mut checkpoints, true).unwrap()
}

fn all_labels(
    dispatcher: &mut dyn LabelDispatcher,
    batch: &RawBatch,
    registry: &SlotRegistry,
) -> Vec<Option<Labels>> {
    dispatcher.prepare(batch).unwrap();
    (0..registry.len())
        .map(|position| dispatcher.labels_for(position, batch, registry).unwrap().labels)
        .collect()
}

#[test]
fn test_identity_dispatch_for_single_slot() {
    let temp_dir = TempDir::new().unwrap();
    let config = RunConfig::new(RunConfigFile::default()).unwrap();
    let registry = registry(&config, temp_dir.path());
    let batch = RawBatch::new(vec![vec![5, 6, 7]]);

    let labels = all_labels(dispatcher_for(&config).as_mut(), &batch, &registry);
    assert_eq!(labels, vec![Some(Labels::Sequence(batch))]);
}

#[test]
fn test_memory_slot_waits_for_primary_trace() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = RunConfigFile::default();
    file.run.multi_slot = true;
    file.slots.memory_layers = 2;
    file.model.vocab_size = 24;
    file.model.embed_dim = 4;
    let config = RunConfig::new(file).unwrap();
    let mut registry = registry(&config, temp_dir.path());
    let mut dispatcher = dispatcher_for(&config);
    let batch = RawBatch::new(vec![vec![2, 3, 4, 5, 6, 7]]);

    dispatcher.prepare(&batch).unwrap();
    // Nothing recorded before the primary slot propagates
    assert!(!dispatcher.labels_for(1, &batch, &registry).unwrap().is_found());

    let primary = dispatcher.labels_for(0, &batch, &registry).unwrap();
    let labels = primary.labels.expect("primary labels");
    registry
        .slot_mut(0)
        .unit
        .propagate(&Device::Cpu, &config.token_context(), &labels)
        .unwrap();

    let layer1 = dispatcher.labels_for(2, &batch, &registry).unwrap();
    assert_eq!(
        layer1.labels,
        Some(Labels::Sequence(RawBatch::new(vec![vec![2, 4, 6]])))
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_vectorized_and_lazy_dispatch_agree(
        rows in prop::collection::vec(prop::collection::vec(0u32..24, 0..10), 1..4)
    ) {
        let temp_dir = TempDir::new().unwrap();
        let vectorized_config = relation_config(LabelMode::Vectorized);
        let lazy_config = relation_config(LabelMode::Lazy);
        let registry = registry(&vectorized_config, temp_dir.path());
        let batch = RawBatch::new(rows);

        let vectorized = all_labels(dispatcher_for(&vectorized_config).as_mut(), &batch, &registry);
        let lazy = all_labels(dispatcher_for(&lazy_config).as_mut(), &batch, &registry);
        prop_assert_eq!(vectorized, lazy);
    }
}
