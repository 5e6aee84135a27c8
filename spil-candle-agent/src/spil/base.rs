use super::{
    DualState, GradientBundle, MultiplierNetConfig, MultiplierSource, PiController,
    RolloutEstimator, SpilConfig, SpilNetworks, TensorBatch,
};
use crate::{model::SubModel1, util::OutDim, EnvModel};
use anyhow::Result;
use candle_core::{Device, Tensor, D};
use candle_nn::loss::mse;
use log::{debug, info, trace};
use spil_core::{
    error::SpilError,
    record::{Record, RecordValue},
    GradientAlgorithm,
};
use std::{
    fs::{self, File},
    io::{BufReader, Write},
    path::{Path, PathBuf},
    time::Instant,
};

const DUAL_STATE_FILE: &str = "dual_state.yaml";

/// Losses of the value, constraint-probability and multiplier networks.
pub struct ValueLosses {
    /// Squared error of the value network against the bootstrapped reward sum.
    pub loss_v: Tensor,

    /// Mean prediction of the value network.
    pub mean_v: f32,

    /// Squared error of the probability network against the safety indicator.
    pub loss_prob: Tensor,

    /// Mean prediction of the probability network.
    pub mean_prob: f32,

    /// Squared error of the multiplier network against its controller target.
    pub loss_lamnet: Tensor,

    /// Mean prediction of the multiplier network.
    pub mean_lamnet: f32,

    /// Fraction of rollouts that stayed safe, per constraint.
    pub safe_prob: Vec<f64>,

    /// Mean of the bootstrapped reward sum.
    pub reward_sum_avg: f32,
}

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Separated proportional-integral Lagrangian (SPIL).
///
/// One call of [`GradientAlgorithm::compute_gradient`] proceeds as follows:
///
/// ```mermaid
/// graph TD
///     B[TensorBatch] --> R1["rollout, no gradient"]
///     R1 --> LV[value, prob and lamnet losses]
///     R1 --> SP[safe_prob]
///     SP --> PI[PiController::step]
///     PI --> M[multiplier]
///     B --> R2["rollout through the policy"]
///     M --> LP[policy loss]
///     R2 --> LP
///     LV --> G[GradientBundle]
///     LP --> G
/// ```
///
/// The losses of the value, constraint-probability and multiplier networks
/// are computed first, so that the estimated safety probability is fresh when
/// the controller produces the multiplier of the policy loss. The controller
/// state is replaced only after the backward pass succeeded; a failing call
/// leaves it untouched.
///
/// Gradients are returned, not applied. [`GradientAlgorithm::apply_gradient`]
/// performs one optimizer step per network and then blends every target
/// network with `tau`.
pub struct Spil<E, V, P, C, L>
where
    E: EnvModel,
    V: SubModel1<Input = Tensor, Output = Tensor>,
    P: SubModel1<Input = Tensor, Output = Tensor>,
    C: SubModel1<Input = Tensor, Output = Tensor>,
    L: SubModel1<Input = Tensor, Output = Tensor>,
{
    env_model: E,
    networks: SpilNetworks<V, P, C, L>,
    rollout: RolloutEstimator,
    controller: PiController,
    multiplier_net: MultiplierNetConfig,
    multiplier_source: MultiplierSource,
    policy_bootstrap: bool,
    dual_state: DualState,
    device: Device,
}

impl<E, V, P, C, L> Spil<E, V, P, C, L>
where
    E: EnvModel,
    V: SubModel1<Input = Tensor, Output = Tensor>,
    P: SubModel1<Input = Tensor, Output = Tensor>,
    C: SubModel1<Input = Tensor, Output = Tensor>,
    L: SubModel1<Input = Tensor, Output = Tensor>,
    V::Config: OutDim + Clone,
    P::Config: OutDim + Clone,
    C::Config: OutDim + Clone,
    L::Config: OutDim + Clone,
{
    /// Constructs the agent around a differentiable model of the environment.
    pub fn build(
        config: SpilConfig<V::Config, P::Config, C::Config, L::Config>,
        env_model: E,
    ) -> Result<Self> {
        config.validate()?;
        let n = config.constraint_dim;
        check_out_dim("value", config.value_config.model_config.as_ref(), 1)?;
        check_out_dim("prob", config.prob_config.model_config.as_ref(), n)?;
        check_out_dim("lamnet", config.lamnet_config.model_config.as_ref(), n)?;

        let device = config.device.to_candle()?;
        let networks = SpilNetworks::build(
            config.value_config,
            config.policy_config,
            config.prob_config,
            config.lamnet_config,
            config.tau,
            &device,
        )?;
        let controller = PiController::new(&config.controller, n)?;
        let rollout = RolloutEstimator::new(
            config.forward_step,
            config.gamma,
            config.reward_scale,
            config.transfer,
        );
        info!(
            "Build SPIL agent: constraint_dim = {}, forward_step = {}, multiplier = {:?}",
            n, config.forward_step, config.multiplier_source
        );

        Ok(Self {
            env_model,
            networks,
            rollout,
            controller,
            multiplier_net: config.multiplier_net,
            multiplier_source: config.multiplier_source,
            policy_bootstrap: config.policy_bootstrap,
            dual_state: DualState::new(n),
            device,
        })
    }
}

fn check_out_dim<M: OutDim>(name: &str, config: Option<&M>, expected: usize) -> Result<()> {
    match config {
        Some(config) if config.get_out_dim() != expected => Err(SpilError::InvalidConfig(format!(
            "output dimension of {} must be {}, got {}",
            name,
            expected,
            config.get_out_dim()
        ))
        .into()),
        _ => Ok(()),
    }
}

impl<E, V, P, C, L> Spil<E, V, P, C, L>
where
    E: EnvModel,
    V: SubModel1<Input = Tensor, Output = Tensor>,
    P: SubModel1<Input = Tensor, Output = Tensor>,
    C: SubModel1<Input = Tensor, Output = Tensor>,
    L: SubModel1<Input = Tensor, Output = Tensor>,
    V::Config: Clone,
    P::Config: Clone,
    C::Config: Clone,
    L::Config: Clone,
{
    /// Returns the networks.
    pub fn networks(&self) -> &SpilNetworks<V, P, C, L> {
        &self.networks
    }

    /// Returns the model of the environment.
    pub fn env_model(&self) -> &E {
        &self.env_model
    }

    /// Returns the rollout estimator.
    pub fn rollout(&self) -> &RolloutEstimator {
        &self.rollout
    }

    /// Returns the state of the PI controller.
    pub fn dual_state(&self) -> &DualState {
        &self.dual_state
    }

    /// Replaces the state of the PI controller, e.g., to restore a snapshot.
    pub fn set_dual_state(&mut self, state: DualState) -> Result<()> {
        let n = self.controller.chance_thre().len();
        if state.dim() != n || state.delta_i.len() != n || state.safe_prob_pre.len() != n {
            return Err(SpilError::InvalidConfig(format!(
                "dual state must have {} entries per field",
                n
            ))
            .into());
        }
        self.dual_state = state;
        Ok(())
    }

    /// Safety probability estimated in the last successful call of `compute_gradient`.
    pub fn safe_prob(&self) -> &[f64] {
        &self.dual_state.safe_prob_pre
    }

    fn inputs(&self, batch: &TensorBatch) -> Result<(Tensor, Tensor)> {
        batch.validate()?;
        let obs = batch.obs.to_device(&self.device)?;
        let done = batch.done.to_device(&self.device)?;
        Ok((obs, done))
    }

    /// Losses of the value, constraint-probability and multiplier networks.
    ///
    /// Regression targets come from a rollout without gradient tracking and
    /// from the target networks; only the online predictions are differentiable.
    /// The target multiplier and probability networks are evaluated on the
    /// observation of the last rollout step, or on the batch observations if
    /// [`MultiplierNetConfig::target_at_final_obs`] is `false`.
    pub fn compute_loss_v(&self, batch: &TensorBatch) -> Result<ValueLosses> {
        let (obs, done) = self.inputs(batch)?;
        let policy = |o: &Tensor| self.networks.policy.forward(o);
        let rollout = self
            .rollout
            .run(policy, &self.env_model, &obs, &done, false)?;

        // Value
        let v_tail = self.networks.value.forward_tgt(&rollout.final_obs)?;
        let r_target = self.rollout.bootstrapped(&rollout, &v_tail)?.detach();
        let v = self.networks.value.forward(&obs)?;
        let loss_v = mse(&v, &r_target)?;

        // Constraint probability
        let prob = self.networks.prob.forward(&obs)?;
        let loss_prob = mse(&prob, &rollout.traj_issafe)?;

        // Multiplier
        let lam = self.networks.lamnet.forward(&obs)?;
        let lam_target = {
            let obs_tgt = if self.multiplier_net.target_at_final_obs {
                &rollout.last_obs
            } else {
                &obs
            };
            let prob_tgt = self.networks.prob.forward_tgt(obs_tgt)?;
            let lam_tgt = self.networks.lamnet.forward_tgt(obs_tgt)?;
            self.controller
                .network_target(&self.multiplier_net, &prob_tgt, &lam_tgt)?
        };
        let loss_lamnet = mse(&lam, &lam_target)?;

        let safe_prob = rollout
            .traj_issafe
            .mean(0)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(f64::from)
            .collect::<Vec<_>>();
        let reward_sum_avg = r_target.mean_all()?.to_scalar::<f32>()?;
        debug!(
            "reward sum = {}, safe probability = {:?}",
            reward_sum_avg, safe_prob
        );

        Ok(ValueLosses {
            mean_v: v.mean_all()?.to_scalar::<f32>()?,
            mean_prob: prob.mean_all()?.to_scalar::<f32>()?,
            mean_lamnet: lam.mean_all()?.to_scalar::<f32>()?,
            loss_v,
            loss_prob,
            loss_lamnet,
            safe_prob,
            reward_sum_avg,
        })
    }

    /// Multiplier of the policy loss.
    ///
    /// `(1, constraint_dim)` from the controller multipliers `lam`, or
    /// `(batch_size, constraint_dim)` from the target multiplier network.
    pub fn multiplier(&self, obs: &Tensor, lam: &[f64]) -> Result<Tensor> {
        match self.multiplier_source {
            MultiplierSource::Controller => {
                let lam: Vec<f32> = lam.iter().map(|v| *v as f32).collect();
                let n = lam.len();
                Ok(Tensor::from_vec(lam, (1, n), &self.device)?)
            }
            MultiplierSource::Network => Ok(self
                .networks
                .lamnet
                .forward_tgt(&obs.to_device(&self.device)?)?
                .detach()),
        }
    }

    /// Loss of the policy.
    ///
    /// The rollout is differentiable through the model and the policy. With
    /// `w_r = 1 / (1 + Σ lam)` and `w_c = lam / (1 + Σ lam)`, the loss is
    /// `-mean(r_sum w_r + Σ_d c_mul[d] w_c[d])`.
    ///
    /// With `policy_bootstrap`, the tail value of the target value network is
    /// differentiated through the final observation only; the target
    /// parameters are left out of the returned gradients.
    pub fn compute_loss_policy(&self, batch: &TensorBatch, multiplier: &Tensor) -> Result<Tensor> {
        let (obs, done) = self.inputs(batch)?;
        let policy = |o: &Tensor| self.networks.policy.forward(o);
        let rollout = self
            .rollout
            .run(policy, &self.env_model, &obs, &done, true)?;

        let r_sum = if self.policy_bootstrap {
            let v_tail = self.networks.value.forward_tgt(&rollout.final_obs)?;
            self.rollout.bootstrapped(&rollout, &v_tail)?
        } else {
            rollout.r_sum
        };

        let multiplier = multiplier.detach();
        let denom = (multiplier.sum_keepdim(D::Minus1)? + 1.0)?;
        let w_r = denom.recip()?;
        let w_c = multiplier.broadcast_div(&denom)?;

        let reward_term = r_sum.broadcast_mul(&w_r)?;
        let constraint_term = rollout
            .c_mul
            .broadcast_mul(&w_c)?
            .sum_keepdim(D::Minus1)?;
        let objective = (reward_term + constraint_term)?.mean_all()?;

        Ok(objective.neg()?)
    }

    fn compute_gradient_(
        &mut self,
        batch: &TensorBatch,
        iteration: usize,
    ) -> Result<(GradientBundle, Record)> {
        let start = Instant::now();

        trace!("compute_loss_v()");
        let losses = self.compute_loss_v(batch)?;

        trace!("PiController::step()");
        let dual_state = self.controller.step(&self.dual_state, &losses.safe_prob)?;
        let multiplier = self.multiplier(&batch.obs, &dual_state.lam)?;

        trace!("compute_loss_policy()");
        let loss_pi = self.compute_loss_policy(batch, &multiplier)?;

        // Every loss depends on the online parameters of a single network
        let loss = (((&losses.loss_v + &losses.loss_prob)? + &losses.loss_lamnet)? + &loss_pi)?;
        let grads = self.networks.gradients(&loss.backward()?)?;

        let mut record = Record::from_slice(&[
            ("loss_critic", RecordValue::Scalar(losses.loss_v.to_scalar::<f32>()?)),
            ("critic_avg_value", RecordValue::Scalar(losses.mean_v)),
            ("loss_prob", RecordValue::Scalar(losses.loss_prob.to_scalar::<f32>()?)),
            ("prob_avg_value", RecordValue::Scalar(losses.mean_prob)),
            (
                "loss_lamnet",
                RecordValue::Scalar(losses.loss_lamnet.to_scalar::<f32>()?),
            ),
            ("lamnet_avg_value", RecordValue::Scalar(losses.mean_lamnet)),
            ("loss_actor", RecordValue::Scalar(loss_pi.to_scalar::<f32>()?)),
            ("reward_sum_avg", RecordValue::Scalar(losses.reward_sum_avg)),
            ("iteration", RecordValue::Scalar(iteration as f32)),
        ]);
        for (d, (p, lam)) in losses.safe_prob.iter().zip(&dual_state.lam).enumerate() {
            record.insert(format!("safe_prob_{}", d), RecordValue::Scalar(*p as f32));
            record.insert(format!("lambda_{}", d), RecordValue::Scalar(*lam as f32));
        }
        record.insert(
            "safe_prob",
            RecordValue::Array1(losses.safe_prob.iter().map(|v| *v as f32).collect()),
        );
        record.insert(
            "lambda",
            RecordValue::Array1(dual_state.lam.iter().map(|v| *v as f32).collect()),
        );

        self.dual_state = dual_state;

        record.insert(
            "alg_time",
            RecordValue::Scalar(start.elapsed().as_secs_f32() * 1000.0),
        );

        Ok((grads, record))
    }
}

impl<E, V, P, C, L> GradientAlgorithm<TensorBatch> for Spil<E, V, P, C, L>
where
    E: EnvModel,
    V: SubModel1<Input = Tensor, Output = Tensor>,
    P: SubModel1<Input = Tensor, Output = Tensor>,
    C: SubModel1<Input = Tensor, Output = Tensor>,
    L: SubModel1<Input = Tensor, Output = Tensor>,
    V::Config: Clone,
    P::Config: Clone,
    C::Config: Clone,
    L::Config: Clone,
{
    type Gradients = GradientBundle;

    fn compute_gradient(
        &mut self,
        batch: &TensorBatch,
        iteration: usize,
    ) -> Result<(GradientBundle, Record)> {
        self.compute_gradient_(batch, iteration)
    }

    fn apply_gradient(&mut self, grads: &GradientBundle) -> Result<()> {
        self.networks.update(grads)
    }

    fn save_params(&self, path: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(path)?;
        let mut paths = self.networks.save(path)?;

        let path_state = path.join(DUAL_STATE_FILE);
        let mut file = File::create(&path_state)?;
        file.write_all(serde_yaml::to_string(&self.dual_state)?.as_bytes())?;
        info!("Save dual state to {:?}", path_state);
        paths.push(path_state);

        Ok(paths)
    }

    fn load_params(&mut self, path: &Path) -> Result<()> {
        let path_state = path.join(DUAL_STATE_FILE);
        let rdr = BufReader::new(File::open(&path_state)?);
        let state: DualState = serde_yaml::from_reader(rdr)?;

        self.networks.load(path)?;
        self.set_dual_state(state)?;
        info!("Load dual state from {:?}", path_state);

        Ok(())
    }
}
