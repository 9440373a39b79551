//! Named trainable parameters

use ndarray::Array2;

/// A trainable matrix together with its accumulated gradient
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Array2<f32>,
    pub grad: Array2<f32>,
}

impl Parameter {
    /// Wrap `value` with a zeroed gradient of the same shape
    pub fn new(name: impl Into<String>, value: Array2<f32>) -> Self {
        let grad = Array2::zeros(value.raw_dim());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn shape(&self) -> (usize, usize) {
        self.value.dim()
    }

    pub fn numel(&self) -> usize {
        self.value.len()
    }
}
