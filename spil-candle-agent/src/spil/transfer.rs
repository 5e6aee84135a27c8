//! Smooth surrogate of the constraint indicator.
use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Constraint transfer function `Φ`.
///
/// ```text
/// Φ(y) = (1 + τ m1) / (1 + m2 τ exp(clamp(y / τ, -10, 5)))
/// ```
///
/// `y <= 0` means the constraint is satisfied. `Φ` is close to `1 + τ m1` for
/// satisfied constraints and decays towards `(1 + τ m1) / (1 + m2 τ e^5)` as
/// the violation grows. The exponent is clamped, so `Φ` is flat outside of
/// `-10 τ <= y <= 5 τ` and never overflows.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct ConstraintTransfer {
    /// Numerator slope `m1`.
    pub m1: f64,

    /// Denominator slope `m2`.
    pub m2: f64,

    /// Temperature `τ`.
    pub tau: f64,
}

/// Bounds of the clamped exponent argument `y / τ`.
const EXP_ARG_MIN: f64 = -10.0;
const EXP_ARG_MAX: f64 = 5.0;

impl Default for ConstraintTransfer {
    fn default() -> Self {
        let m1 = 1.0;
        Self {
            m1,
            m2: m1 / (1.0 + m1) * 0.9,
            tau: 0.07,
        }
    }
}

impl ConstraintTransfer {
    /// Upper bound of `Φ`, `1 + τ m1`.
    pub fn upper_bound(&self) -> f64 {
        1.0 + self.tau * self.m1
    }

    /// Applies `Φ` elementwise.
    pub fn forward(&self, y: &Tensor) -> Result<Tensor> {
        let e = y
            .affine(1.0 / self.tau, 0.0)?
            .clamp(EXP_ARG_MIN, EXP_ARG_MAX)?
            .exp()?;
        let denom = e.affine(self.m2 * self.tau, 1.0)?;
        Ok(denom.recip()?.affine(self.upper_bound(), 0.0)?)
    }
}
