//! Differentiable model of the environment dynamics.
use anyhow::Result;
use candle_core::Tensor;

/// Outputs of one step of an [`EnvModel`].
#[derive(Debug, Clone)]
pub struct ModelStep {
    /// Predicted next observation, `(batch_size, obs_dim)`.
    pub next_obs: Tensor,

    /// Reward, `(batch_size,)`.
    pub reward: Tensor,

    /// Done flags, `(batch_size,)`.
    pub done: Tensor,

    /// Signed constraint values, `(batch_size, constraint_dim)`.
    ///
    /// Non-positive values mean the constraint is satisfied.
    pub constraint: Tensor,
}

/// A side-effect-free and differentiable model of the environment.
///
/// The rollout of the policy loss backpropagates through `forward` as many
/// times as the rollout horizon, so implementations must be built from
/// differentiable tensor operations and must not detach their inputs.
pub trait EnvModel {
    /// Predicts the outcome of taking `act` in `obs`.
    fn forward(&self, obs: &Tensor, act: &Tensor, done: &Tensor) -> Result<ModelStep>;
}
