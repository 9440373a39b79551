//! Reference unit: a weighted bag-of-tokens softmax classifier
//!
//! Every training example is a weighted bag of context tokens and a single
//! target token. The bag is embedded (`h = Σ w · E[token]`), projected onto
//! the output vocabulary (`logits = h·W + b`) and scored with softmax cross
//! entropy. The unit kind only decides how examples are cut from the labels:
//!
//! - `Sequence`: masked positions predicted from a two-sided window; an
//!   unmasked batch falls back to next-token prediction
//! - `Recurrent`: next token from the full history with geometric decay
//! - `Autoregressive`: next token from the last `context_window` tokens
//! - `EnsembleRelation`: explicit (input, target) pairs

use crate::init::{init_weight, param_seed};
use crate::{
    Device, Labels, Mode, Parameter, Propagation, RawBatch, TokenContext, TrainableUnit,
    UnitConfig, UnitError, UnitKind,
};
use anyhow::Result;
use ndarray::{Array2, Axis};

/// Weights below this are dropped from a recurrent history
const MIN_HISTORY_WEIGHT: f32 = 1e-3;

#[derive(Debug, Clone)]
struct Example {
    context: Vec<(u32, f32)>,
    target: u32,
}

#[derive(Debug, Clone)]
struct Gradients {
    embedding: Array2<f32>,
    output: Array2<f32>,
    bias: Array2<f32>,
}

/// Reference implementation of [`TrainableUnit`] for every [`UnitKind`]
#[derive(Debug, Clone)]
pub struct BagUnit {
    config: UnitConfig,
    embedding: Parameter,
    output: Parameter,
    bias: Parameter,
    mode: Mode,
    device: Device,
    pending: Option<Gradients>,
    trace: Vec<Vec<u32>>,
}

impl BagUnit {
    /// Build a freshly initialized unit
    ///
    /// # Arguments
    /// * `config` - Unit configuration; `vocab_size` sizes both embedding and output
    ///
    /// # Returns
    /// Unit in train mode on the CPU
    pub fn new(config: UnitConfig) -> Result<Self> {
        config.validate()?;
        let v = config.vocab_size;
        let d = config.embed_dim;
        Ok(Self {
            embedding: Parameter::new("embedding", init_weight(v, d, param_seed(config.seed, 0))),
            output: Parameter::new("output", init_weight(d, v, param_seed(config.seed, 1))),
            bias: Parameter::new("bias", Array2::zeros((1, v))),
            config,
            mode: Mode::Train,
            device: Device::Cpu,
            pending: None,
            trace: Vec::new(),
        })
    }

    /// Expected `(rows, cols)` of every parameter, in checkpoint order
    pub fn parameter_shapes(config: &UnitConfig) -> [(&'static str, (usize, usize)); 3] {
        let v = config.vocab_size;
        let d = config.embed_dim;
        [("embedding", (v, d)), ("output", (d, v)), ("bias", (1, v))]
    }

    fn check_token(&self, token: u32) -> Result<(), UnitError> {
        if token as usize >= self.config.vocab_size {
            return Err(UnitError::TokenOutOfRange {
                token,
                vocab_size: self.config.vocab_size,
            });
        }
        Ok(())
    }

    fn examples(&self, ctx: &TokenContext, labels: &Labels) -> Result<Vec<Example>, UnitError> {
        let examples = match (self.config.kind, labels) {
            (UnitKind::EnsembleRelation, Labels::Pairs(pairs)) => pairs
                .iter()
                .map(|pair| Example {
                    context: vec![(pair.input, 1.0)],
                    target: pair.target,
                })
                .collect(),
            (UnitKind::Sequence, Labels::Sequence(batch)) if batch.is_masked() => {
                self.masked_examples(ctx, batch)
            }
            (UnitKind::Sequence, Labels::Sequence(batch)) => {
                self.next_token_examples(ctx, batch, |distance| 1.0 / distance as f32)
            }
            (UnitKind::Autoregressive, Labels::Sequence(batch)) => {
                self.next_token_examples(ctx, batch, |_| 1.0)
            }
            (UnitKind::Recurrent, Labels::Sequence(batch)) => self.recurrent_examples(ctx, batch),
            (kind, labels) => {
                return Err(UnitError::LabelsMismatch {
                    kind,
                    found: match labels {
                        Labels::Sequence(_) => "sequence",
                        Labels::Pairs(_) => "pair",
                    },
                })
            }
        };

        for example in &examples {
            self.check_token(example.target)?;
            for &(token, _) in &example.context {
                self.check_token(token)?;
            }
        }
        Ok(examples)
    }

    fn masked_examples(&self, ctx: &TokenContext, batch: &RawBatch) -> Vec<Example> {
        let window = self.config.context_window;
        let rows = batch.rows();
        batch
            .masked()
            .iter()
            .filter(|m| !ctx.is_special(m.original))
            .filter_map(|m| {
                let row = rows.get(m.row)?;
                let lo = m.position.saturating_sub(window);
                let hi = (m.position + window + 1).min(row.len());
                let context: Vec<(u32, f32)> = (lo..hi)
                    .filter(|&j| j != m.position && !ctx.is_special(row[j]))
                    .map(|j| (row[j], 1.0 / m.position.abs_diff(j) as f32))
                    .collect();
                (!context.is_empty()).then(|| Example {
                    context,
                    target: m.original,
                })
            })
            .collect()
    }

    fn next_token_examples(
        &self,
        ctx: &TokenContext,
        batch: &RawBatch,
        weight: impl Fn(usize) -> f32,
    ) -> Vec<Example> {
        let window = self.config.context_window;
        let mut examples = Vec::new();
        for row in batch.rows() {
            for t in 1..row.len() {
                if ctx.is_special(row[t]) {
                    continue;
                }
                let lo = t.saturating_sub(window);
                let context: Vec<(u32, f32)> = (lo..t)
                    .filter(|&j| !ctx.is_special(row[j]))
                    .map(|j| (row[j], weight(t - j)))
                    .collect();
                if context.is_empty() {
                    continue;
                }
                let total: f32 = context.iter().map(|&(_, w)| w).sum();
                examples.push(Example {
                    context: context.into_iter().map(|(tok, w)| (tok, w / total)).collect(),
                    target: row[t],
                });
            }
        }
        examples
    }

    fn recurrent_examples(&self, ctx: &TokenContext, batch: &RawBatch) -> Vec<Example> {
        let decay = self.config.decay;
        let mut examples = Vec::new();
        for row in batch.rows() {
            // Decayed state carried along the row
            let mut state: Vec<(u32, f32)> = Vec::new();
            for (t, &token) in row.iter().enumerate() {
                if t > 0 && !ctx.is_special(token) && !state.is_empty() {
                    examples.push(Example {
                        context: state.clone(),
                        target: token,
                    });
                }
                for entry in state.iter_mut() {
                    entry.1 *= decay;
                }
                state.retain(|&(_, w)| w >= MIN_HISTORY_WEIGHT);
                if !ctx.is_special(token) {
                    state.push((token, 1.0 - decay));
                }
            }
        }
        examples
    }

    fn forward(&mut self, examples: &[Example]) -> Propagation {
        let n = examples.len();
        let mut hidden = Array2::<f32>::zeros((n, self.config.embed_dim));
        for (i, example) in examples.iter().enumerate() {
            let mut row = hidden.row_mut(i);
            for &(token, w) in &example.context {
                row.scaled_add(w, &self.embedding.value.row(token as usize));
            }
        }

        let mut probs = hidden.dot(&self.output.value) + &self.bias.value;
        for mut row in probs.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|x| x / sum);
        }

        let mut loss = 0.0;
        let mut correct = 0usize;
        for (i, example) in examples.iter().enumerate() {
            let row = probs.row(i);
            let target = example.target as usize;
            loss -= row[target].max(1e-12).ln();
            let (argmax, _) = row
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (j, &p)| if p > best.1 { (j, p) } else { best });
            if argmax == target {
                correct += 1;
            }
        }

        if self.mode == Mode::Train {
            let mut dlogits = probs;
            for (i, example) in examples.iter().enumerate() {
                dlogits[[i, example.target as usize]] -= 1.0;
            }
            dlogits /= n as f32;

            let d_hidden = dlogits.dot(&self.output.value.t());
            let mut d_embedding = Array2::<f32>::zeros(self.embedding.value.raw_dim());
            for (i, example) in examples.iter().enumerate() {
                for &(token, w) in &example.context {
                    d_embedding
                        .row_mut(token as usize)
                        .scaled_add(w, &d_hidden.row(i));
                }
            }
            self.pending = Some(Gradients {
                embedding: d_embedding,
                output: hidden.t().dot(&dlogits),
                bias: dlogits.sum_axis(Axis(0)).insert_axis(Axis(0)),
            });
        }

        Propagation {
            loss: loss / n as f32,
            accuracy: correct as f32 / n as f32,
            result: true,
        }
    }
}

impl TrainableUnit for BagUnit {
    fn kind(&self) -> UnitKind {
        self.config.kind
    }

    fn config(&self) -> &UnitConfig {
        &self.config
    }

    fn propagate(
        &mut self,
        device: &Device,
        ctx: &TokenContext,
        labels: &Labels,
    ) -> Result<Propagation> {
        if *device != self.device {
            return Err(UnitError::DeviceMismatch {
                unit: self.device,
                requested: *device,
            }
            .into());
        }
        self.pending = None;

        if let (UnitKind::Sequence, Labels::Sequence(batch)) = (self.config.kind, labels) {
            self.trace = batch.original_rows();
        }

        let examples = self.examples(ctx, labels)?;
        if examples.is_empty() {
            return Ok(Propagation::degenerate());
        }
        Ok(self.forward(&examples))
    }

    fn backward(&mut self) -> Result<()> {
        let grads = self.pending.take().ok_or(UnitError::NoPendingGradients)?;
        self.embedding.grad += &grads.embedding;
        self.output.grad += &grads.output;
        self.bias.grad += &grads.bias;
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.pending = None;
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.embedding, &self.output, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.embedding, &mut self.output, &mut self.bias]
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        if mode == Mode::Eval {
            self.pending = None;
        }
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn to_device(&mut self, device: Device) {
        self.device = device;
    }

    fn device(&self) -> Device {
        self.device
    }

    /// Every `layer + 1`-th token of the last sequence batch, masking undone
    fn memory_trace(&self, layer: usize) -> Option<RawBatch> {
        if self.config.kind != UnitKind::Sequence || self.trace.is_empty() {
            return None;
        }
        let stride = layer + 1;
        let rows = self
            .trace
            .iter()
            .map(|row| row.iter().step_by(stride).copied().collect())
            .collect();
        Some(RawBatch::new(rows))
    }
}
