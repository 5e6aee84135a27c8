#![allow(dead_code)]
use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use spil_candle_agent::{
    mlp::{Mlp, MlpConfig},
    spil::{Spil, SpilConfig, TensorBatch},
    util::{lock_vars, NamedTensors},
    EnvModel, ModelStep,
};
use candle_nn::VarMap;

pub const DIM_OBS: usize = 1;
pub const DIM_ACT: usize = 1;
pub const DIM_CONSTRAINT: usize = 1;
pub const FORWARD_STEP: usize = 3;

/// next_obs = obs + act, reward = -|obs|^2, constraint = obs - 5.
pub struct LinearModel;

impl EnvModel for LinearModel {
    fn forward(&self, obs: &Tensor, act: &Tensor, done: &Tensor) -> Result<ModelStep> {
        Ok(ModelStep {
            next_obs: (obs + act)?,
            reward: obs.sqr()?.sum(D::Minus1)?.neg()?,
            done: done.clone(),
            constraint: (obs - 5.0)?,
        })
    }
}

/// [`LinearModel`] with a second constraint `0.5 - obs`.
pub struct TwoConstraintModel;

impl EnvModel for TwoConstraintModel {
    fn forward(&self, obs: &Tensor, act: &Tensor, done: &Tensor) -> Result<ModelStep> {
        let step = LinearModel.forward(obs, act, done)?;
        let lower = obs.affine(-1.0, 0.5)?;
        Ok(ModelStep {
            constraint: Tensor::cat(&[&step.constraint, &lower], D::Minus1)?,
            ..step
        })
    }
}

pub type Agent = Spil<LinearModel, Mlp, Mlp, Mlp, Mlp>;
pub type Config = SpilConfig<MlpConfig, MlpConfig, MlpConfig, MlpConfig>;

pub fn config() -> Config {
    SpilConfig::mlp(DIM_OBS, DIM_ACT, DIM_CONSTRAINT).forward_step(FORWARD_STEP)
}

pub fn create_agent(config: Config) -> Result<Agent> {
    Spil::build(config, LinearModel)
}

/// Batch starting from the given scalar observations.
pub fn batch(obs: &[f32]) -> Result<TensorBatch> {
    let n = obs.len();
    let d = &Device::Cpu;
    let obs = Tensor::from_slice(obs, (n, DIM_OBS), d)?;
    Ok(TensorBatch {
        act: Tensor::zeros((n, DIM_ACT), DType::F32, d)?,
        rew: obs.sqr()?.sum(D::Minus1)?.neg()?,
        con: (&obs - 5.0)?,
        obs2: obs.clone(),
        done: Tensor::zeros(n, DType::F32, d)?,
        obs,
    })
}

/// Every trajectory stays below the constraint boundary.
pub fn safe_batch() -> Result<TensorBatch> {
    batch(&[0.0, 0.25, 0.5, 1.0])
}

/// Every trajectory starts beyond the constraint boundary.
pub fn unsafe_batch() -> Result<TensorBatch> {
    batch(&[10.0, 11.0, 12.0, 13.0])
}

pub fn flat(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.flatten_all()?.to_vec1::<f32>()?)
}

pub fn params(varmap: &VarMap) -> Result<Vec<(String, Vec<f32>)>> {
    let vars = lock_vars(varmap)?;
    let mut params = vars
        .iter()
        .map(|(k, v)| Ok((k.clone(), flat(v.as_tensor())?)))
        .collect::<Result<Vec<_>>>()?;
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

pub fn sorted(grads: &NamedTensors) -> Result<Vec<(String, Vec<f32>)>> {
    let mut grads = grads
        .iter()
        .map(|(k, v)| Ok((k.clone(), flat(v)?)))
        .collect::<Result<Vec<_>>>()?;
    grads.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(grads)
}
