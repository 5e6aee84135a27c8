//! Container of the four trainable networks.
use super::{component::Trainable, Component, ComponentConfig, ComponentKind};
use crate::{model::SubModel1, util::NamedTensors};
use anyhow::Result;
use candle_core::{backprop::GradStore, Device, Tensor};
use std::path::{Path, PathBuf};

/// Gradients of the online parameters of every network.
///
/// Gradients are keyed by parameter names, so a bundle computed by one
/// [`SpilNetworks`] can be applied to another one with the same layout.
#[derive(Clone, Debug, Default)]
pub struct GradientBundle {
    /// Gradients of the value network.
    pub value: NamedTensors,

    /// Gradients of the policy network.
    pub policy: NamedTensors,

    /// Gradients of the constraint-probability network.
    pub prob: NamedTensors,

    /// Gradients of the multiplier network.
    pub lamnet: NamedTensors,
}

impl GradientBundle {
    /// Returns the gradients of the given network.
    pub fn get(&self, kind: ComponentKind) -> &NamedTensors {
        match kind {
            ComponentKind::Value => &self.value,
            ComponentKind::Policy => &self.policy,
            ComponentKind::ConstraintProb => &self.prob,
            ComponentKind::Multiplier => &self.lamnet,
        }
    }
}

/// Value, policy, constraint-probability and multiplier networks with their targets.
pub struct SpilNetworks<V, P, C, L>
where
    V: SubModel1<Input = Tensor, Output = Tensor>,
    P: SubModel1<Input = Tensor, Output = Tensor>,
    C: SubModel1<Input = Tensor, Output = Tensor>,
    L: SubModel1<Input = Tensor, Output = Tensor>,
{
    /// State-value function.
    pub value: Component<V>,

    /// Deterministic policy.
    pub policy: Component<P>,

    /// Safety probability estimator.
    pub prob: Component<C>,

    /// Learned multiplier.
    pub lamnet: Component<L>,

    tau: f64,
}

impl<V, P, C, L> SpilNetworks<V, P, C, L>
where
    V: SubModel1<Input = Tensor, Output = Tensor>,
    P: SubModel1<Input = Tensor, Output = Tensor>,
    C: SubModel1<Input = Tensor, Output = Tensor>,
    L: SubModel1<Input = Tensor, Output = Tensor>,
    V::Config: Clone,
    P::Config: Clone,
    C::Config: Clone,
    L::Config: Clone,
{
    /// Constructs the networks; `tau` is the blend factor of the target updates.
    pub fn build(
        value_config: ComponentConfig<V::Config>,
        policy_config: ComponentConfig<P::Config>,
        prob_config: ComponentConfig<C::Config>,
        lamnet_config: ComponentConfig<L::Config>,
        tau: f64,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            value: Component::build(ComponentKind::Value, value_config, device)?,
            policy: Component::build(ComponentKind::Policy, policy_config, device)?,
            prob: Component::build(ComponentKind::ConstraintProb, prob_config, device)?,
            lamnet: Component::build(ComponentKind::Multiplier, lamnet_config, device)?,
            tau,
        })
    }

    /// Blend factor of the target updates.
    pub fn tau(&self) -> f64 {
        self.tau
    }

    fn components(&self) -> [&dyn Trainable; 4] {
        [&self.value, &self.policy, &self.prob, &self.lamnet]
    }

    fn components_mut(&mut self) -> [&mut dyn Trainable; 4] {
        [
            &mut self.value,
            &mut self.policy,
            &mut self.prob,
            &mut self.lamnet,
        ]
    }

    /// Collects the gradients of all online parameters from a backward pass.
    pub fn gradients(&self, grads: &GradStore) -> Result<GradientBundle> {
        Ok(GradientBundle {
            value: self.value.gradients(grads)?,
            policy: self.policy.gradients(grads)?,
            prob: self.prob.gradients(grads)?,
            lamnet: self.lamnet.gradients(grads)?,
        })
    }

    /// Applies one optimizer step per network, then blends every target with `tau`.
    ///
    /// The bundle is checked before any parameter is touched.
    pub fn update(&mut self, grads: &GradientBundle) -> Result<()> {
        for c in self.components() {
            c.check(grads.get(c.kind()))?;
        }

        for c in self.components_mut() {
            c.apply(grads.get(c.kind()))?;
        }

        self.soft_update(self.tau)
    }

    /// Blends the online parameters into the targets,
    /// `target = tau * online + (1 - tau) * target`.
    pub fn soft_update(&self, tau: f64) -> Result<()> {
        for c in self.components() {
            c.soft_update(tau)?;
        }
        Ok(())
    }

    /// Saves online and target parameters of all networks in `path`.
    pub fn save(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for c in self.components() {
            paths.extend(c.save(path)?);
        }
        Ok(paths)
    }

    /// Loads online and target parameters of all networks from `path`.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        for c in self.components_mut() {
            c.load(path)?;
        }
        Ok(())
    }
}
