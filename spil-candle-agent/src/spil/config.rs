//! Configuration of SPIL agent.
use super::{
    ComponentConfig, ConstraintTransfer, MultiplierNetConfig, MultiplierSource, PiControllerConfig,
};
use crate::{
    mlp::MlpConfig,
    opt::OptimizerConfig,
    Activation, Device,
};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use spil_core::error::SpilError;
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`Spil`](super::Spil).
///
/// `V`, `P`, `C` and `L` are the model configurations of the value, policy,
/// constraint-probability and multiplier networks.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct SpilConfig<V, P, C, L> {
    /// Configuration of the value network.
    pub value_config: ComponentConfig<V>,

    /// Configuration of the policy network.
    pub policy_config: ComponentConfig<P>,

    /// Configuration of the constraint-probability network.
    pub prob_config: ComponentConfig<C>,

    /// Configuration of the multiplier network.
    pub lamnet_config: ComponentConfig<L>,

    /// Number of constraints.
    pub constraint_dim: usize,

    /// Discount factor.
    pub gamma: f64,

    /// Blend factor of the target networks.
    pub tau: f64,

    /// Number of model steps of a rollout.
    pub forward_step: usize,

    /// Scaling factor of rewards in the rollout.
    pub reward_scale: f64,

    /// Constraint transfer function.
    pub transfer: ConstraintTransfer,

    /// Closed-form PI controller.
    pub controller: PiControllerConfig,

    /// Learned multiplier.
    pub multiplier_net: MultiplierNetConfig,

    /// Multiplier used in the policy loss.
    pub multiplier_source: MultiplierSource,

    /// If `true`, the reward sum of the policy objective includes the value of the final state.
    pub policy_bootstrap: bool,

    /// Device of the networks.
    pub device: Device,
}

impl<V, P, C, L> Default for SpilConfig<V, P, C, L> {
    fn default() -> Self {
        Self {
            value_config: ComponentConfig::default(),
            policy_config: ComponentConfig::default(),
            prob_config: ComponentConfig::default(),
            lamnet_config: ComponentConfig::default(),
            constraint_dim: 1,
            gamma: 0.99,
            tau: 0.005,
            forward_step: 25,
            reward_scale: 0.02,
            transfer: ConstraintTransfer::default(),
            controller: PiControllerConfig::default(),
            multiplier_net: MultiplierNetConfig::default(),
            multiplier_source: MultiplierSource::default(),
            policy_bootstrap: false,
            device: Device::default(),
        }
    }
}

impl SpilConfig<MlpConfig, MlpConfig, MlpConfig, MlpConfig> {
    /// Configuration with multilayer perceptrons for all networks.
    pub fn mlp(obs_dim: usize, act_dim: usize, constraint_dim: usize) -> Self {
        let adam = |lr| OptimizerConfig::Adam { lr };

        let value = MlpConfig::new(obs_dim, vec![64, 64], 1);
        let policy = MlpConfig::new(obs_dim, vec![64, 64], act_dim)
            .hidden_activation(Activation::Elu)
            .output_activation(Activation::Tanh);
        let prob = MlpConfig::new(obs_dim, vec![128, 64, 16], constraint_dim)
            .hidden_activation(Activation::Elu)
            .output_activation(Activation::UnitTanh);
        let lamnet = MlpConfig::new(obs_dim, vec![64, 64], constraint_dim)
            .hidden_activation(Activation::Elu)
            .output_activation(Activation::Softplus);

        Self::default()
            .constraint_dim(constraint_dim)
            .value_config(ComponentConfig::default().model_config(value).opt_config(adam(2e-3)))
            .policy_config(ComponentConfig::default().model_config(policy).opt_config(adam(3e-4)))
            .prob_config(ComponentConfig::default().model_config(prob).opt_config(adam(2e-2)))
            .lamnet_config(ComponentConfig::default().model_config(lamnet).opt_config(adam(2e-3)))
    }
}

impl<V, P, C, L> SpilConfig<V, P, C, L> {
    /// Sets the configuration of the value network.
    pub fn value_config(mut self, v: ComponentConfig<V>) -> Self {
        self.value_config = v;
        self
    }

    /// Sets the configuration of the policy network.
    pub fn policy_config(mut self, v: ComponentConfig<P>) -> Self {
        self.policy_config = v;
        self
    }

    /// Sets the configuration of the constraint-probability network.
    pub fn prob_config(mut self, v: ComponentConfig<C>) -> Self {
        self.prob_config = v;
        self
    }

    /// Sets the configuration of the multiplier network.
    pub fn lamnet_config(mut self, v: ComponentConfig<L>) -> Self {
        self.lamnet_config = v;
        self
    }

    /// Number of constraints.
    pub fn constraint_dim(mut self, v: usize) -> Self {
        self.constraint_dim = v;
        self
    }

    /// Discount factor.
    pub fn gamma(mut self, v: f64) -> Self {
        self.gamma = v;
        self
    }

    /// Blend factor of the target networks.
    pub fn tau(mut self, v: f64) -> Self {
        self.tau = v;
        self
    }

    /// Number of model steps of a rollout.
    pub fn forward_step(mut self, v: usize) -> Self {
        self.forward_step = v;
        self
    }

    /// Reward scale.
    pub fn reward_scale(mut self, v: f64) -> Self {
        self.reward_scale = v;
        self
    }

    /// Constraint transfer function.
    pub fn transfer(mut self, v: ConstraintTransfer) -> Self {
        self.transfer = v;
        self
    }

    /// PI controller.
    pub fn controller(mut self, v: PiControllerConfig) -> Self {
        self.controller = v;
        self
    }

    /// Learned multiplier.
    pub fn multiplier_net(mut self, v: MultiplierNetConfig) -> Self {
        self.multiplier_net = v;
        self
    }

    /// Multiplier used in the policy loss.
    pub fn multiplier_source(mut self, v: MultiplierSource) -> Self {
        self.multiplier_source = v;
        self
    }

    /// Bootstrap the reward sum of the policy objective.
    pub fn policy_bootstrap(mut self, v: bool) -> Self {
        self.policy_bootstrap = v;
        self
    }

    /// Device.
    pub fn device(mut self, v: Device) -> Self {
        self.device = v;
        self
    }

    /// Checks the scalar hyperparameters.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(SpilError::InvalidConfig(msg).into()) };

        if self.constraint_dim == 0 {
            return invalid("constraint_dim must be positive".to_string());
        }
        if self.forward_step == 0 {
            return invalid("forward_step must be positive".to_string());
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            return invalid(format!("gamma must be in (0, 1], got {}", self.gamma));
        }
        if !(0.0..=1.0).contains(&self.tau) {
            return invalid(format!("tau must be in [0, 1], got {}", self.tau));
        }
        if !self.reward_scale.is_finite() {
            return invalid(format!("reward_scale must be finite, got {}", self.reward_scale));
        }
        if !(self.transfer.tau > 0.0) {
            return invalid(format!(
                "temperature of the transfer function must be positive, got {}",
                self.transfer.tau
            ));
        }
        Ok(())
    }
}

impl<V, P, C, L> SpilConfig<V, P, C, L>
where
    V: Serialize + for<'de> Deserialize<'de>,
    P: Serialize + for<'de> Deserialize<'de>,
    C: Serialize + for<'de> Deserialize<'de>,
    L: Serialize + for<'de> Deserialize<'de>,
{
    /// Constructs [`SpilConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of SPIL agent from {:?}", path_);
        Ok(b)
    }

    /// Saves [`SpilConfig`] to YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of SPIL agent into {:?}", path_);
        Ok(())
    }
}
