//! Trainable network with a target copy and an optimizer.
use crate::{
    model::SubModel1,
    opt::{Optimizer, OptimizerConfig},
    util::{lock_vars, track, NamedTensors},
};
use anyhow::Result;
use candle_core::{backprop::GradStore, DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::{info, trace};
use serde::{Deserialize, Serialize};
use spil_core::error::SpilError;
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// The four trainable networks of the algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ComponentKind {
    /// State-value function.
    Value,

    /// Deterministic policy.
    Policy,

    /// Estimator of the probability that a rollout stays safe.
    ConstraintProb,

    /// Learned Lagrange multiplier.
    Multiplier,
}

impl ComponentKind {
    /// All kinds in a fixed order.
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::Value,
        ComponentKind::Policy,
        ComponentKind::ConstraintProb,
        ComponentKind::Multiplier,
    ];

    /// Stable name, used as the prefix of parameter names and in file names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Policy => "policy",
            Self::ConstraintProb => "prob",
            Self::Multiplier => "lamnet",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`Component`].
pub struct ComponentConfig<M> {
    /// Configuration of the model.
    pub model_config: Option<M>,

    /// Configuration of the optimizer of the online model.
    pub opt_config: OptimizerConfig,
}

impl<M> Default for ComponentConfig<M> {
    fn default() -> Self {
        Self {
            model_config: None,
            opt_config: OptimizerConfig::default(),
        }
    }
}

impl<M> ComponentConfig<M> {
    /// Sets the configuration of the model.
    pub fn model_config(mut self, v: M) -> Self {
        self.model_config = Some(v);
        self
    }

    /// Sets the configuration of the optimizer.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }
}

/// Online network, its target network and the optimizer of the online one.
///
/// Parameters are named `<kind>.<model parameter>` in both [`VarMap`]s. The
/// target parameters have their own storage, are never seen by the optimizer
/// and only change through [`Component::soft_update`].
pub struct Component<M>
where
    M: SubModel1<Input = Tensor, Output = Tensor>,
{
    kind: ComponentKind,
    varmap: VarMap,
    model: M,
    varmap_tgt: VarMap,
    model_tgt: M,
    opt: Optimizer,
}

impl<M> Component<M>
where
    M: SubModel1<Input = Tensor, Output = Tensor>,
    M::Config: Clone,
{
    /// Constructs the component; the target starts as an exact copy of the online network.
    pub fn build(
        kind: ComponentKind,
        config: ComponentConfig<M::Config>,
        device: &Device,
    ) -> Result<Self> {
        let model_config = config.model_config.ok_or_else(|| {
            SpilError::InvalidConfig(format!("model_config of {} is not set", kind))
        })?;

        let varmap = VarMap::new();
        let model = {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).set_prefix(kind.name());
            M::build(vb, model_config.clone())?
        };
        let varmap_tgt = VarMap::new();
        let model_tgt = {
            let vb =
                VarBuilder::from_varmap(&varmap_tgt, DType::F32, device).set_prefix(kind.name());
            M::build(vb, model_config)?
        };
        track(&varmap_tgt, &varmap, 1.0)?;

        let opt = config.opt_config.build(varmap.all_vars())?;

        Ok(Self {
            kind,
            varmap,
            model,
            varmap_tgt,
            model_tgt,
            opt,
        })
    }

    /// Returns the kind of the component.
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Forward pass of the online network.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.model.forward(xs)
    }

    /// Forward pass of the target network.
    ///
    /// The output stays differentiable with respect to `xs`. The target
    /// parameters are variables of their own [`VarMap`], so a backward pass
    /// through this output also computes gradients for them. Those gradients
    /// are dropped: [`Component::gradients`] reads the online parameters only
    /// and the optimizer holds no target variable.
    pub fn forward_tgt(&self, xs: &Tensor) -> Result<Tensor> {
        self.model_tgt.forward(xs)
    }

    /// Parameters of the online network.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Parameters of the target network.
    pub fn varmap_tgt(&self) -> &VarMap {
        &self.varmap_tgt
    }

    /// Collects the gradients of the online parameters from a backward pass.
    pub fn gradients(&self, grads: &GradStore) -> Result<NamedTensors> {
        NamedTensors::from_grads(&self.varmap, grads)
    }
}

/// Operations of [`Component`] that do not depend on the model type.
pub(crate) trait Trainable {
    fn kind(&self) -> ComponentKind;

    /// Fails unless `grads` has a gradient of matching shape for every online parameter.
    fn check(&self, grads: &NamedTensors) -> Result<()>;

    fn apply(&mut self, grads: &NamedTensors) -> Result<()>;

    fn soft_update(&self, tau: f64) -> Result<()>;

    fn save(&self, path: &Path) -> Result<Vec<PathBuf>>;

    fn load(&mut self, path: &Path) -> Result<()>;
}

impl<M> Trainable for Component<M>
where
    M: SubModel1<Input = Tensor, Output = Tensor>,
    M::Config: Clone,
{
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn check(&self, grads: &NamedTensors) -> Result<()> {
        for (name, var) in lock_vars(&self.varmap)?.iter() {
            let grad = grads
                .get(name)
                .ok_or_else(|| SpilError::MissingGradient(name.clone()))?;
            if grad.dims() != var.dims() {
                return Err(SpilError::BatchShapeMismatch {
                    key: name.clone(),
                    expected: format!("{:?}", var.dims()),
                    actual: grad.dims().to_vec(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn apply(&mut self, grads: &NamedTensors) -> Result<()> {
        self.opt.step_named(&self.varmap, grads)
    }

    fn soft_update(&self, tau: f64) -> Result<()> {
        trace!("soft update of {}", self.kind);
        track(&self.varmap_tgt, &self.varmap, tau)
    }

    fn save(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let path_online = path.join(format!("{}.pt", self.kind));
        let path_tgt = path.join(format!("{}.tgt.pt", self.kind));
        self.varmap.save(&path_online)?;
        self.varmap_tgt.save(&path_tgt)?;
        info!("Save {} to {:?}", self.kind, path_online);
        Ok(vec![path_online, path_tgt])
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let path_online = path.join(format!("{}.pt", self.kind));
        let path_tgt = path.join(format!("{}.tgt.pt", self.kind));
        self.varmap.load(&path_online)?;
        self.varmap_tgt.load(&path_tgt)?;
        info!("Load {} from {:?}", self.kind, path_online);
        Ok(())
    }
}
