//! Metric aggregation
//!
//! Each batch, every slot reports an optional `(loss, accuracy)`; `None` means
//! the slot was skipped and stands in as `(0.0, 0.0)`. The aggregator folds
//! these into one batch value and keeps two kinds of accumulator per tracked
//! quantity:
//! - a running average over a window of `W` batches, for display
//! - a cumulative average over the epoch, for the epoch summary
//!
//! In bifurcated mode slot 0 and the mean of the remaining slots are tracked
//! separately.

use crate::config::RunConfig;
use crate::step::StepOutcome;
use serde::{Deserialize, Serialize};

/// Exponentially weighted running average
///
/// `new = old / W * (W - 1) + x / W`. A window of 0 disables averaging: the
/// value is always the last sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningMetric {
    value: f32,
    window: usize,
}

impl RunningMetric {
    pub fn new(window: usize) -> Self {
        Self { value: 0.0, window }
    }

    pub fn update(&mut self, x: f32) -> f32 {
        self.value = if self.window == 0 {
            x
        } else {
            let w = self.window as f32;
            self.value / w * (w - 1.0) + x / w
        };
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn is_enabled(&self) -> bool {
        self.window > 0
    }
}

/// Sum and count of every recorded sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CumulativeMetric {
    sum: f64,
    count: usize,
    exclude_nan: bool,
}

impl CumulativeMetric {
    /// # Arguments
    /// * `exclude_nan` - Drop NaN samples from both sum and count
    pub fn new(exclude_nan: bool) -> Self {
        Self {
            sum: 0.0,
            count: 0,
            exclude_nan,
        }
    }

    /// Record a sample; returns whether it was counted
    pub fn record(&mut self, x: f32) -> bool {
        if self.exclude_nan && x.is_nan() {
            return false;
        }
        self.sum += f64::from(x);
        self.count += 1;
        true
    }

    /// Mean of the counted samples, 0 when nothing was counted
    pub fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Running and cumulative accumulators of one `(loss, accuracy)` stream
#[derive(Debug, Clone, Copy)]
struct Track {
    running_loss: RunningMetric,
    running_accuracy: RunningMetric,
    loss: CumulativeMetric,
    accuracy: CumulativeMetric,
}

impl Track {
    fn new(window: usize, exclude_nan: bool) -> Self {
        Self {
            running_loss: RunningMetric::new(window),
            running_accuracy: RunningMetric::new(window),
            // Gated on the accuracy sample in `update`
            loss: CumulativeMetric::new(false),
            accuracy: CumulativeMetric::new(exclude_nan),
        }
    }

    /// A dropped accuracy sample drops the loss of the same batch
    fn update(&mut self, loss: f32, accuracy: f32) {
        if self.accuracy.record(accuracy) {
            self.loss.record(loss);
        }
        self.running_loss.update(loss);
        self.running_accuracy.update(accuracy);
    }

    fn displayed(&self) -> (f32, f32) {
        (self.running_loss.value(), self.running_accuracy.value())
    }

    /// Epoch value: running when averaging is on during training, cumulative otherwise
    fn summary(&self, training: bool) -> (f32, f32) {
        if training && self.running_loss.is_enabled() {
            self.displayed()
        } else {
            (self.loss.mean(), self.accuracy.mean())
        }
    }
}

/// Metrics of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMetrics {
    /// Mean over all slots before any averaging, skipped slots as `(0.0, 0.0)`
    pub raw: Option<(f32, f32)>,
    /// Displayed loss, running-averaged when enabled
    pub loss: f32,
    /// Displayed accuracy; slot 0 in bifurcated mode
    pub accuracy: f32,
    /// Displayed accuracy of the other slots in bifurcated mode
    pub secondary_accuracy: Option<f32>,
    /// Per-slot displayed `(loss, accuracy)`; `(0.0, 0.0)` for skipped slots
    pub slots: Vec<(f32, f32)>,
}

impl BatchMetrics {
    /// Progress line fragment
    pub fn describe(&self) -> String {
        match self.secondary_accuracy {
            Some(secondary) => format!(
                "accuracy={:.4} accuracy2={:.4}",
                self.accuracy, secondary
            ),
            None => format!("loss={:.4} accuracy={:.4}", self.loss, self.accuracy),
        }
    }
}

/// Per-epoch result of a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Batches seen
    pub batches: usize,
    /// Batches that contributed to the averages
    pub counted: usize,
    pub loss: f32,
    pub accuracy: f32,
    /// Mean accuracy of slots 1.. in bifurcated mode
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub secondary_accuracy: Option<f32>,
}

/// Mean `(loss, accuracy)` of the given samples, `None` when empty
fn mean_of(samples: impl Iterator<Item = (f32, f32)>) -> Option<(f32, f32)> {
    let (mut loss, mut accuracy, mut n) = (0.0f32, 0.0f32, 0usize);
    for (l, a) in samples {
        loss += l;
        accuracy += a;
        n += 1;
    }
    (n > 0).then(|| (loss / n as f32, accuracy / n as f32))
}

/// Folds per-slot outcomes into batch and epoch metrics
///
/// One aggregator lives for one epoch of one phase.
#[derive(Debug, Clone)]
pub struct MetricAggregator {
    training: bool,
    pending: Vec<Option<(f32, f32)>>,
    per_slot: Vec<(RunningMetric, RunningMetric)>,
    primary: Track,
    secondary: Option<Track>,
    batches: usize,
}

impl MetricAggregator {
    /// # Arguments
    /// * `config` - Run configuration (window, bifurcation, baseline mode)
    /// * `slot_count` - Number of slots reporting each batch
    /// * `training` - Whether this is a training epoch
    pub fn new(config: &RunConfig, slot_count: usize, training: bool) -> Self {
        let window = config.metrics.running_average_window;
        // NaN results are only expected from the baseline unit under evaluation
        let exclude_nan = !training && config.debug.baseline_model;
        let track = Track::new(window, exclude_nan);
        Self {
            training,
            pending: vec![None; slot_count],
            per_slot: vec![(RunningMetric::new(window), RunningMetric::new(window)); slot_count],
            primary: track,
            secondary: config.debug.bifurcated_metrics.then_some(track),
            batches: 0,
        }
    }

    /// Record the outcome of the slot at `position` for the current batch
    pub fn record(&mut self, position: usize, outcome: &StepOutcome) {
        self.pending[position] = outcome.metrics();
    }

    /// Close the current batch
    pub fn finish_batch(&mut self) -> BatchMetrics {
        self.batches += 1;
        let outcomes = std::mem::replace(&mut self.pending, vec![None; self.per_slot.len()]);

        let slots = outcomes
            .iter()
            .zip(self.per_slot.iter_mut())
            .map(|(outcome, (loss, accuracy))| match outcome {
                Some((l, a)) => (loss.update(*l), accuracy.update(*a)),
                None => (0.0, 0.0),
            })
            .collect();

        let samples: Vec<(f32, f32)> = outcomes
            .iter()
            .map(|outcome| outcome.unwrap_or((0.0, 0.0)))
            .collect();
        let raw = mean_of(samples.iter().copied());
        let secondary_accuracy = match &mut self.secondary {
            Some(secondary) => {
                if let Some(&(loss, accuracy)) = samples.first() {
                    self.primary.update(loss, accuracy);
                }
                if let Some((loss, accuracy)) = mean_of(samples.iter().skip(1).copied()) {
                    secondary.update(loss, accuracy);
                }
                Some(secondary.displayed().1)
            }
            None => {
                if let Some((loss, accuracy)) = raw {
                    self.primary.update(loss, accuracy);
                }
                None
            }
        };

        let (loss, accuracy) = self.primary.displayed();
        BatchMetrics {
            raw,
            loss,
            accuracy,
            secondary_accuracy,
            slots,
        }
    }

    /// Summary of the epoch so far
    pub fn epoch_summary(&self, epoch: usize) -> EpochSummary {
        let (loss, accuracy) = self.primary.summary(self.training);
        EpochSummary {
            epoch,
            batches: self.batches,
            counted: self.primary.accuracy.count(),
            loss,
            accuracy,
            secondary_accuracy: self.secondary.map(|s| s.summary(self.training).1),
        }
    }
}
