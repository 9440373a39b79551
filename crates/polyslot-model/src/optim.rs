//! AdamW optimizer over named parameters
//!
//! AdamW decouples weight decay from the gradient-based update:
//! `θ_t = (1 - lr * λ) * θ_{t-1} - lr_t * m_t / (√v_t + ε)`, with the bias
//! correction folded into `lr_t`.

use crate::Parameter;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Something that turns accumulated gradients into a parameter update
pub trait Optimizer {
    /// Apply one update to `params` using their accumulated gradients
    ///
    /// Parameters must be passed in the same order on every call; moment
    /// buffers are matched by position.
    fn step(&mut self, params: &mut [&mut Parameter]);
}

/// AdamW hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamWConfig {
    /// Learning rate
    pub learning_rate: f32,
    /// Beta1 (first moment decay)
    pub beta1: f32,
    /// Beta2 (second moment decay)
    pub beta2: f32,
    /// Epsilon
    pub eps: f32,
    /// Decoupled weight decay
    pub weight_decay: f32,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// AdamW optimizer
#[derive(Debug, Clone)]
pub struct AdamW {
    config: AdamWConfig,
    t: u64,
    m: Vec<Option<Array2<f32>>>,
    v: Vec<Option<Array2<f32>>>,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Number of updates applied so far
    pub fn step_count(&self) -> u64 {
        self.t
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        if self.m.len() < params.len() {
            self.m.resize(params.len(), None);
            self.v.resize(params.len(), None);
        }
        self.t += 1;

        let AdamWConfig {
            learning_rate: lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        // Bias correction factors
        let lr_t = lr * ((1.0 - beta2.powi(self.t as i32)).sqrt() / (1.0 - beta1.powi(self.t as i32)));
        let decay_factor = 1.0 - lr * weight_decay;

        for (i, param) in params.iter_mut().enumerate() {
            let grad = &param.grad;

            // m_t = β1 * m_{t-1} + (1 - β1) * g
            let m_t = match &self.m[i] {
                Some(m) => m * beta1 + grad * (1.0 - beta1),
                None => grad * (1.0 - beta1),
            };

            // v_t = β2 * v_{t-1} + (1 - β2) * g²
            let grad_sq = grad * grad;
            let v_t = match &self.v[i] {
                Some(v) => v * beta2 + &grad_sq * (1.0 - beta2),
                None => &grad_sq * (1.0 - beta2),
            };

            let update = &m_t / &(v_t.mapv(f32::sqrt) + eps) * lr_t;
            param.value.mapv_inplace(|x| x * decay_factor);
            param.value -= &update;

            self.m[i] = Some(m_t);
            self.v[i] = Some(v_t);
        }
    }
}
