//! SPIL agent.
//!
//! [`Spil`] learns a deterministic policy under chance constraints of the form
//! `P(trajectory stays safe) >= chance_thre`. Returns and safety indicators
//! are estimated by rolling the policy out for `forward_step` steps in a
//! differentiable [`EnvModel`](crate::EnvModel) ([`RolloutEstimator`]). The
//! constraint terms of the policy objective are weighted by Lagrange
//! multipliers from a separated PI controller ([`PiController`]).
//!
//! The multipliers have two realizations. The closed-form controller acts on
//! the safety probability of the batch and carries its state ([`DualState`])
//! across calls. A multiplier network is trained towards the same control law
//! evaluated per state. With the default [`MultiplierSource::Controller`] the
//! policy only sees the closed-form multipliers and the network is trained
//! alongside without influencing it; [`MultiplierSource::Network`] switches
//! the policy loss to the target multiplier network.
mod base;
mod batch;
mod component;
mod config;
mod controller;
mod networks;
mod rollout;
mod transfer;
pub use base::{Spil, ValueLosses};
pub use batch::{TensorBatch, BATCH_KEYS};
pub use component::{Component, ComponentConfig, ComponentKind};
pub use config::SpilConfig;
pub use controller::{
    DualState, IntegralSeparation, MultiplierNetConfig, MultiplierSource, PiController,
    PiControllerConfig, PiGains, INTEGRAL_UPPER_BOUND, MULTIPLIER_UPPER_BOUND,
};
pub use networks::{GradientBundle, SpilNetworks};
pub use rollout::{Rollout, RolloutEstimator};
pub use transfer::ConstraintTransfer;
