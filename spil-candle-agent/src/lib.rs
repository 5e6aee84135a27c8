//! SPIL agent implemented with [candle](https://crates.io/crates/candle-core).
//!
//! The agent learns a deterministic policy under chance constraints. Returns
//! and constraint signals are estimated by rolling the policy out through a
//! differentiable [`EnvModel`], and the Lagrange multipliers weighting the
//! constraint terms are produced by a separated PI controller, see [`spil`].
mod activation;
pub mod env_model;
pub mod mlp;
pub mod model;
pub mod opt;
pub mod spil;
pub mod util;
pub use activation::Activation;
use anyhow::Result;
pub use env_model::{EnvModel, ModelStep};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq)]
/// Device for using candle.
///
/// This enum is added because [`candle_core::Device`] does not support serialization.
pub enum Device {
    /// The main CPU device.
    Cpu,

    /// The main GPU device.
    Cuda(usize),
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl Device {
    /// Returns the corresponding [`candle_core::Device`].
    pub fn to_candle(self) -> Result<candle_core::Device> {
        match self {
            Self::Cpu => Ok(candle_core::Device::Cpu),
            Self::Cuda(n) => Ok(candle_core::Device::new_cuda(n)?),
        }
    }
}
