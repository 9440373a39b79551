//! Epoch, batch and slot loops of the train and test phases

use crate::checkpoint::CheckpointManager;
use crate::config::RunConfig;
use crate::dataloader::BatchSourceFactory;
use crate::labels::{dispatcher_for, LabelDispatcher};
use crate::metrics::{EpochSummary, MetricAggregator};
use crate::report::TestReport;
use crate::slots::SlotRegistry;
use crate::step::StepExecutor;
use crate::window::window_for;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{debug, info};

/// Results of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Per-epoch training summaries; empty when the run does not train
    pub train: Vec<EpochSummary>,
    /// Per-epoch test summaries; empty when the run does not test
    pub test: Vec<EpochSummary>,
    /// JSON test report, when one was written
    pub report: Option<PathBuf>,
}

/// Loops of one phase over an already built registry
struct PhaseRunner<'a> {
    config: &'a RunConfig,
    registry: SlotRegistry,
    executor: StepExecutor,
    dispatcher: Box<dyn LabelDispatcher>,
    training: bool,
    quiet: bool,
}

impl<'a> PhaseRunner<'a> {
    fn new(
        config: &'a RunConfig,
        checkpoints: &mut CheckpointManager,
        training: bool,
        quiet: bool,
    ) -> Result<Self> {
        let registry = SlotRegistry::build(config, checkpoints, training)?;
        let executor = StepExecutor::new(config, registry.device());
        Ok(Self {
            config,
            registry,
            executor,
            dispatcher: dispatcher_for(config),
            training,
            quiet,
        })
    }

    fn label(&self) -> &'static str {
        if self.training {
            "train"
        } else {
            "test"
        }
    }

    fn progress_bar(&self, epoch: usize, len: Option<usize>) -> Result<ProgressBar> {
        if self.quiet {
            return Ok(ProgressBar::hidden());
        }
        let bar = match len {
            Some(len) => {
                let bar = ProgressBar::new(len as u64);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{prefix} {bar:30.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}")?,
                );
                bar
            }
            None => ProgressBar::new_spinner(),
        };
        bar.set_prefix(format!("[{} epoch {}]", self.label(), epoch));
        Ok(bar)
    }

    /// One pass over the phase's file window
    ///
    /// The batch source is opened fresh for every epoch. For each batch the
    /// dispatcher prepares once, then every slot gets its labels and steps in
    /// slot order.
    fn run_epoch(
        &mut self,
        epoch: usize,
        factory: &dyn BatchSourceFactory,
        checkpoints: &mut CheckpointManager,
    ) -> Result<EpochSummary> {
        let window = window_for(self.config, self.training);
        if let Some(window) = window {
            debug!(phase = self.label(), epoch, %window, "opening file window");
        }
        let mut source = factory
            .open(window, self.config.uses_masking())
            .with_context(|| format!("Failed to open batch source for epoch {epoch}"))?;
        let bar = self.progress_bar(epoch, source.len_hint())?;
        let mut aggregator = MetricAggregator::new(self.config, self.registry.len(), self.training);

        let mut batch_index = 0;
        while let Some(batch) = source.next_batch()? {
            self.dispatcher.prepare(&batch)?;
            for position in 0..self.registry.len() {
                let labels = self
                    .dispatcher
                    .labels_for(position, &batch, &self.registry)?;
                let slot = self.registry.slot_mut(position);
                let outcome = if self.training {
                    self.executor
                        .train_step(slot, &labels, batch_index, checkpoints)?
                } else {
                    self.executor.eval_step(slot, &labels)?
                };
                aggregator.record(position, &outcome);
            }

            let metrics = aggregator.finish_batch();
            debug!(
                phase = self.label(),
                epoch,
                batch_index,
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                "batch finished"
            );
            bar.set_message(format!("batch {} {}", batch_index, metrics.describe()));
            bar.inc(1);
            batch_index += 1;
        }
        bar.finish_and_clear();

        if self.training && !self.config.debug.skip_training {
            self.save_at_epoch_end(batch_index, checkpoints)?;
        }
        Ok(aggregator.epoch_summary(epoch))
    }

    /// Final save of a training epoch of `batches` batches
    ///
    /// Every slot is saved when the last batch fell off the cadence. Otherwise
    /// only slots changed since their last save are written, which covers a
    /// slot skipped on the last cadence batch.
    fn save_at_epoch_end(
        &mut self,
        batches: usize,
        checkpoints: &mut CheckpointManager,
    ) -> Result<()> {
        let off_cadence = self.executor.cadence().needs_final_save(batches);
        for slot in self.registry.iter_mut() {
            if off_cadence || slot.has_unsaved_changes() {
                slot.save(checkpoints)?;
            }
        }
        Ok(())
    }

    fn run(
        mut self,
        factory: &dyn BatchSourceFactory,
        checkpoints: &mut CheckpointManager,
    ) -> Result<Vec<EpochSummary>> {
        info!(
            phase = self.label(),
            slots = self.registry.len(),
            epochs = ?self.config.epochs(),
            "phase started"
        );
        let mut summaries = Vec::new();
        for epoch in self.config.epochs() {
            let summary = self.run_epoch(epoch, factory, checkpoints)?;
            print_summary(self.label(), &summary);
            summaries.push(summary);
        }
        info!(phase = self.label(), "phase finished");
        Ok(summaries)
    }
}

fn print_summary(phase: &str, summary: &EpochSummary) {
    match summary.secondary_accuracy {
        Some(secondary) => println!(
            "{} epoch {}: accuracy={:.6} accuracy2={:.6} ({} of {} batches)",
            phase, summary.epoch, summary.accuracy, secondary, summary.counted, summary.batches
        ),
        None => println!(
            "{} epoch {}: loss={:.6} accuracy={:.6} ({} of {} batches)",
            phase, summary.epoch, summary.loss, summary.accuracy, summary.counted, summary.batches
        ),
    }
}

/// Train every slot for the configured epochs
///
/// Fresh units are created unless the run resumes, in which case every slot
/// is loaded from its checkpoint. Slots are saved on the batch cadence and,
/// when changed since their last save, at the end of each epoch.
///
/// # Arguments
/// * `config` - Validated run configuration
/// * `factory` - Opens the batch source of each epoch
/// * `checkpoints` - Slot checkpoint storage
/// * `quiet` - Hide progress bars
///
/// # Returns
/// One summary per epoch
pub fn train_phase(
    config: &RunConfig,
    factory: &dyn BatchSourceFactory,
    checkpoints: &mut CheckpointManager,
    quiet: bool,
) -> Result<Vec<EpochSummary>> {
    PhaseRunner::new(config, checkpoints, true, quiet)?.run(factory, checkpoints)
}

/// Evaluate every slot from its checkpoint (or the baseline unit)
pub fn test_phase(
    config: &RunConfig,
    factory: &dyn BatchSourceFactory,
    checkpoints: &mut CheckpointManager,
    quiet: bool,
) -> Result<Vec<EpochSummary>> {
    PhaseRunner::new(config, checkpoints, false, quiet)?.run(factory, checkpoints)
}

/// Run the configured phases: train, test, or train then test
///
/// The test phase reloads every slot from disk, so it evaluates exactly what
/// the training phase saved. After testing, a report is written to the
/// report directory.
pub fn run(
    config: &RunConfig,
    factory: &dyn BatchSourceFactory,
    checkpoints: &mut CheckpointManager,
    quiet: bool,
) -> Result<RunOutcome> {
    let mut outcome = RunOutcome::default();

    if config.run.phase.trains() {
        outcome.train = train_phase(config, factory, checkpoints, quiet)?;
        info!(saves = checkpoints.save_count(), "training complete");
    }

    if config.run.phase.tests() {
        outcome.test = test_phase(config, factory, checkpoints, quiet)?;
        let report = TestReport::generate(config, config.slot_count(), &outcome.test);
        let path = report.write(&config.metrics.report_dir)?;
        info!(path = %path.display(), "test report written");
        outcome.report = Some(path);
    }

    Ok(outcome)
}
