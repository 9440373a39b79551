//! End-to-end tests of the train and test phases

use polyslot_model::{
    architecture, AdamW, Device, Labels, Mode, Optimizer, RawBatch, TokenContext, UnitKind,
};
use polyslot_train::checkpoint::CheckpointManager;
use polyslot_train::config::{Phase, RelationSpace, RunConfig, RunConfigFile};
use polyslot_train::dataloader::ShardSourceFactory;
use polyslot_train::error::OrchestratorError;
use polyslot_train::train::{run, RunOutcome};
use std::path::Path;
use tempfile::TempDir;

/// One shard holding tokens 2..18: four rows of 4 tokens, two batches of 2 rows
fn write_shard(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    let tokens: Vec<String> = (2..18).map(|t: u32| t.to_string()).collect();
    std::fs::write(dir.join("shard_000.tokens"), tokens.join(" ")).unwrap();
}

fn base_file(root: &Path, algorithm: UnitKind) -> RunConfigFile {
    write_shard(&root.join("data"));
    let mut file = RunConfigFile::default();
    file.run.algorithm = algorithm;
    file.run.phase = Phase::Train;
    file.data.dir = root.join("data");
    file.data.batch_size = 2;
    file.data.seq_len = 4;
    file.data.reserve_validation_set = false;
    file.model.vocab_size = 32;
    file.model.embed_dim = 8;
    file.checkpoint.dir = root.join("checkpoints");
    file.checkpoint.cadence_batches = 1;
    file.metrics.running_average_window = 0;
    file.metrics.report_dir = root.join("reports");
    file
}

fn execute(file: RunConfigFile) -> (anyhow::Result<RunOutcome>, CheckpointManager) {
    let config = RunConfig::new(file).expect("config should validate");
    let mut checkpoints = CheckpointManager::new(
        config.checkpoint.dir.clone(),
        architecture(config.unit_template()),
    );
    let factory = ShardSourceFactory::from_config(&config);
    let outcome = run(&config, &factory, &mut checkpoints, true);
    (outcome, checkpoints)
}

fn relation_space(name: &str, delimiters: Vec<u32>) -> RelationSpace {
    RelationSpace {
        name: name.to_string(),
        delimiters,
        paired: false,
    }
}

#[test]
fn test_single_slot_two_batches_saves_twice_and_reports_mean() {
    let temp_dir = TempDir::new().unwrap();
    let file = base_file(temp_dir.path(), UnitKind::Autoregressive);
    let config = RunConfig::new(file.clone()).unwrap();

    let (outcome, checkpoints) = execute(file);
    let outcome = outcome.unwrap();

    assert_eq!(checkpoints.save_count(), 2);
    assert!(checkpoints.exists(None));
    assert_eq!(outcome.train.len(), 1);
    assert!(outcome.test.is_empty());

    // Replay the two steps by hand from the same seeded unit
    let mut unit = architecture(config.unit_template()).create(32).unwrap();
    unit.set_mode(Mode::Train);
    let mut optimizer = AdamW::new(config.optimizer.clone());
    let ctx = TokenContext::new(32);
    let mut results = Vec::new();
    for rows in [
        vec![vec![2, 3, 4, 5], vec![6, 7, 8, 9]],
        vec![vec![10, 11, 12, 13], vec![14, 15, 16, 17]],
    ] {
        unit.zero_grad();
        let p = unit
            .propagate(&Device::Cpu, &ctx, &Labels::Sequence(RawBatch::new(rows)))
            .unwrap();
        unit.backward().unwrap();
        optimizer.step(&mut unit.parameters_mut());
        results.push((p.loss, p.accuracy));
    }

    let summary = &outcome.train[0];
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.counted, 2);
    assert!((summary.loss - (results[0].0 + results[1].0) / 2.0).abs() < 1e-5);
    assert!((summary.accuracy - (results[0].1 + results[1].1) / 2.0).abs() < 1e-5);
}

#[test]
fn test_train_then_test_writes_report() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::Recurrent);
    file.run.phase = Phase::TrainTest;

    let (outcome, _) = execute(file);
    let outcome = outcome.unwrap();

    assert_eq!(outcome.test.len(), 1);
    assert_eq!(outcome.test[0].batches, 2);
    assert!(outcome.test[0].loss.is_finite());
    let report = outcome.report.expect("report path");
    assert!(report.is_file());
    assert!(temp_dir.path().join("reports/test_report.md").is_file());
}

#[test]
fn test_resume_without_checkpoint_fails_before_training() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::Autoregressive);
    file.run.start_epoch = 1;

    let (outcome, checkpoints) = execute(file);
    let err = outcome.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OrchestratorError>(),
        Some(OrchestratorError::CheckpointMissing { .. })
    ));
    assert_eq!(checkpoints.save_count(), 0);
}

#[test]
fn test_test_only_needs_checkpoints() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::Autoregressive);
    file.run.phase = Phase::Test;

    let (outcome, _) = execute(file);
    let err = outcome.unwrap_err();
    assert_eq!(
        err.downcast_ref::<OrchestratorError>().map(OrchestratorError::exit_code),
        Some(3)
    );
}

#[test]
fn test_resume_continues_from_saved_slot() {
    let temp_dir = TempDir::new().unwrap();
    let file = base_file(temp_dir.path(), UnitKind::Autoregressive);
    let (first, _) = execute(file.clone());
    first.unwrap();

    let mut resumed = file;
    resumed.run.start_epoch = 1;
    resumed.run.phase = Phase::TrainTest;
    let (outcome, checkpoints) = execute(resumed);
    let outcome = outcome.unwrap();

    assert_eq!(outcome.train[0].epoch, 1);
    assert_eq!(outcome.test[0].epoch, 1);
    assert_eq!(checkpoints.save_count(), 2);
}

#[test]
fn test_relation_space_without_occurrences_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::EnsembleRelation);
    file.run.multi_slot = true;
    file.slots.relation_spaces = vec![
        relation_space("present", vec![7, 11]),
        relation_space("absent", vec![30]),
    ];

    let (outcome, checkpoints) = execute(file);
    let outcome = outcome.unwrap();

    // Two saves on prepare, then one cadence save per batch for the present space only
    assert_eq!(checkpoints.save_count(), 4);
    assert!(checkpoints.exists(Some(0)));
    assert!(checkpoints.exists(Some(1)));
    assert_eq!(outcome.train[0].counted, 2);
}

#[test]
fn test_relation_slots_testable_after_dry_run() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::EnsembleRelation);
    file.run.multi_slot = true;
    file.run.phase = Phase::TrainTest;
    file.debug.skip_training = true;
    file.slots.relation_spaces = vec![relation_space("present", vec![7, 11])];

    let (outcome, checkpoints) = execute(file);
    let outcome = outcome.unwrap();

    // Only the save on prepare happens
    assert_eq!(checkpoints.save_count(), 1);
    assert_eq!(outcome.train[0].loss, 0.0);
    assert_eq!(outcome.train[0].accuracy, 0.0);
    assert_eq!(outcome.test[0].counted, 2);
}

#[test]
fn test_memory_layer_slots_train_on_primary_trace() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::Sequence);
    file.run.multi_slot = true;
    file.run.phase = Phase::TrainTest;
    file.slots.memory_layers = 1;
    file.data.mask_fraction = 0.5;
    file.checkpoint.cadence_batches = 100;

    let (outcome, checkpoints) = execute(file);
    let outcome = outcome.unwrap();

    assert!(checkpoints.exists(Some(0)));
    assert!(checkpoints.exists(Some(1)));
    // Primary at batch 0, the memory slot too when its trace was ready, then both at epoch end
    assert!((3..=4).contains(&checkpoints.save_count()));
    assert_eq!(outcome.test[0].batches, 2);
    assert_eq!(outcome.test[0].counted, 2);
}

#[test]
fn test_single_slot_dry_run_saves_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::Autoregressive);
    file.debug.skip_training = true;

    let (outcome, checkpoints) = execute(file);
    outcome.unwrap();
    assert_eq!(checkpoints.save_count(), 0);
    assert!(!checkpoints.exists(None));
}

#[test]
fn test_off_cadence_last_batch_is_saved_once_more() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::Autoregressive);
    file.checkpoint.cadence_batches = 100;

    let (outcome, checkpoints) = execute(file);
    outcome.unwrap();

    // Batch 0, then the end of the epoch at batch 1
    assert_eq!(checkpoints.save_count(), 2);
    assert!(checkpoints.exists(None));
}

#[test]
fn test_off_cadence_last_batch_saves_every_slot() {
    let temp_dir = TempDir::new().unwrap();
    let mut file = base_file(temp_dir.path(), UnitKind::EnsembleRelation);
    file.run.multi_slot = true;
    file.checkpoint.cadence_batches = 100;
    file.slots.relation_spaces = vec![
        relation_space("present", vec![7, 11]),
        relation_space("absent", vec![30]),
    ];

    let (outcome, checkpoints) = execute(file);
    outcome.unwrap();

    // Two on prepare, the present space at batch 0, both spaces at epoch end
    assert_eq!(checkpoints.save_count(), 5);
}
