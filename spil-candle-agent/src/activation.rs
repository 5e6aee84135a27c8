//! Activation functions of the networks.
use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Activation function applied after a linear layer.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub enum Activation {
    /// No activation.
    Identity,

    /// Rectified linear unit.
    ReLU,

    /// Exponential linear unit with `alpha = 1`.
    Elu,

    /// Hyperbolic tangent.
    Tanh,

    /// Hyperbolic tangent mapped to `(0, 1)`, i.e., `0.5 * tanh(x) + 0.5`.
    ///
    /// Used for networks estimating probabilities.
    UnitTanh,

    /// `ln(1 + exp(x))`, for non-negative outputs.
    Softplus,
}

impl Default for Activation {
    fn default() -> Self {
        Self::Identity
    }
}

impl Activation {
    /// Applies the activation function.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = match self {
            Self::Identity => xs.clone(),
            Self::ReLU => xs.relu()?,
            Self::Elu => xs.elu(1.0)?,
            Self::Tanh => xs.tanh()?,
            Self::UnitTanh => xs.tanh()?.affine(0.5, 0.5)?,
            // max(x, 0) + ln(1 + exp(-|x|)) does not overflow for large x
            Self::Softplus => (xs.relu()? + (xs.abs()?.neg()?.exp()? + 1.0)?.log()?)?,
        };
        Ok(ys)
    }
}
