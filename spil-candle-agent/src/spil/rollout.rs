//! Multi-step rollout through the environment model.
use super::ConstraintTransfer;
use crate::EnvModel;
use anyhow::Result;
use candle_core::{DType, Tensor};
use log::trace;
use spil_core::error::SpilError;

/// Outcome of a rollout of `horizon` steps.
#[derive(Debug, Clone)]
pub struct Rollout {
    /// Scaled discounted reward sum without the tail term, `(batch_size, 1)`.
    pub r_sum: Tensor,

    /// 1 if the constraint stayed non-positive at every step, else 0, `(batch_size, constraint_dim)`.
    pub traj_issafe: Tensor,

    /// Sum of the transferred constraint values, `(batch_size, constraint_dim)`.
    pub c_sum: Tensor,

    /// Product of the transferred constraint values, `(batch_size, constraint_dim)`.
    pub c_mul: Tensor,

    /// Observation fed to the last model step, `(batch_size, obs_dim)`.
    pub last_obs: Tensor,

    /// Observation after the last step, `(batch_size, obs_dim)`.
    pub final_obs: Tensor,
}

/// Estimates returns and constraint signals by rolling the policy out in the model.
///
/// The estimator feeds the predicted next observation back into the policy
/// and never consults anything outside this closed loop. It always runs
/// exactly `horizon` steps; `done` flags predicted by the model are passed on
/// to the next model call but do not stop the rollout, so constraint checks
/// also apply after a predicted termination.
#[derive(Debug, Clone)]
pub struct RolloutEstimator {
    horizon: usize,
    gamma: f64,
    reward_scale: f64,
    transfer: ConstraintTransfer,
}

impl RolloutEstimator {
    /// Constructs the estimator.
    pub fn new(horizon: usize, gamma: f64, reward_scale: f64, transfer: ConstraintTransfer) -> Self {
        Self {
            horizon,
            gamma,
            reward_scale,
            transfer,
        }
    }

    /// Returns the number of steps of a rollout.
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Discount applied to the value of the final observation, `gamma^horizon`.
    pub fn tail_discount(&self) -> f64 {
        self.gamma.powf(self.horizon as f64)
    }

    /// Rolls `policy` out in `model` from `obs`.
    ///
    /// If `track_grad` is `false`, every intermediate tensor is detached and
    /// the outputs are constants. Otherwise the outputs are differentiable
    /// with respect to the parameters of the policy through the model.
    pub fn run<F, E>(
        &self,
        policy: F,
        model: &E,
        obs: &Tensor,
        done: &Tensor,
        track_grad: bool,
    ) -> Result<Rollout>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
        E: EnvModel + ?Sized,
    {
        let detach = |t: Tensor| if track_grad { t } else { t.detach() };
        let batch_size = obs.dims()[0];

        let mut obs = detach(obs.clone());
        let mut done = done.detach();
        let mut r_sum: Option<Tensor> = None;
        let mut c_sum: Option<Tensor> = None;
        let mut c_mul: Option<Tensor> = None;
        let mut traj_issafe: Option<Tensor> = None;
        let mut last_obs: Option<Tensor> = None;

        for step in 0..self.horizon {
            let act = detach(policy(&obs)?);
            let out = model.forward(&obs, &act, &done)?;
            let discount = self.reward_scale * self.gamma.powf(step as f64);

            let r = (detach(out.reward).reshape((batch_size, 1))? * discount)?;
            let constraint = detach(out.constraint);
            let safe = constraint.le(0.0)?.to_dtype(DType::F32)?;
            let c = self.transfer.forward(&constraint)?;

            r_sum = Some(match r_sum {
                None => r,
                Some(s) => (s + r)?,
            });
            traj_issafe = Some(match traj_issafe {
                None => safe,
                Some(s) => (s * safe)?,
            });
            c_sum = Some(match c_sum {
                None => c.clone(),
                Some(s) => (s + &c)?,
            });
            c_mul = Some(match c_mul {
                None => c,
                Some(m) => (m * c)?,
            });

            last_obs = Some(obs);
            obs = detach(out.next_obs);
            done = out.done.detach();
            trace!("rollout step {}", step);
        }

        match (r_sum, traj_issafe, c_sum, c_mul, last_obs) {
            (Some(r_sum), Some(traj_issafe), Some(c_sum), Some(c_mul), Some(last_obs)) => Ok(Rollout {
                r_sum,
                traj_issafe,
                c_sum,
                c_mul,
                last_obs,
                final_obs: obs,
            }),
            _ => Err(SpilError::InvalidConfig(
                "rollout horizon must be positive".to_string(),
            )
            .into()),
        }
    }

    /// Adds the tail term `gamma^horizon * v_tail` to the reward sum of `rollout`.
    ///
    /// `v_tail` is the value of [`Rollout::final_obs`], `(batch_size, 1)`.
    pub fn bootstrapped(&self, rollout: &Rollout, v_tail: &Tensor) -> Result<Tensor> {
        let tail = (v_tail.reshape(rollout.r_sum.shape())? * self.tail_discount())?;
        Ok((&rollout.r_sum + tail)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ModelStep;
    use candle_core::Device;
    use std::cell::Cell;

    /// next_obs = obs + act, reward = -obs^2, constraint = obs - 5.
    struct LinearModel {
        calls: Cell<usize>,
    }

    impl EnvModel for LinearModel {
        fn forward(&self, obs: &Tensor, act: &Tensor, done: &Tensor) -> Result<ModelStep> {
            self.calls.set(self.calls.get() + 1);
            let n = obs.dims()[0];
            Ok(ModelStep {
                next_obs: (obs + act)?,
                reward: obs.sqr()?.neg()?.reshape(n)?,
                // Terminal from the first step on
                done: done.ones_like()?,
                constraint: (obs - 5.0)?,
            })
        }
    }

    fn setup(horizon: usize) -> Result<(RolloutEstimator, LinearModel, Tensor, Tensor)> {
        let estimator = RolloutEstimator::new(horizon, 0.99, 1.0, ConstraintTransfer::default());
        let model = LinearModel {
            calls: Cell::new(0),
        };
        let obs = Tensor::new(&[[0f32], [2.0], [3.0], [4.0]], &Device::Cpu)?;
        let done = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
        Ok((estimator, model, obs, done))
    }

    fn policy(obs: &Tensor) -> Result<Tensor> {
        Ok(obs.ones_like()?)
    }

    fn assert_close(xs: &[f32], ys: &[f32], eps: f32) {
        assert_eq!(xs.len(), ys.len());
        for (x, y) in xs.iter().zip(ys.iter()) {
            assert!((x - y).abs() < eps, "{:?} != {:?}", xs, ys);
        }
    }

    #[test]
    fn test_linear_model_rollout() -> Result<()> {
        let (estimator, model, obs, done) = setup(3)?;
        let rollout = estimator.run(policy, &model, &obs, &done, false)?;

        let r_sum = rollout.r_sum.flatten_all()?.to_vec1::<f32>()?;
        assert_close(&r_sum, &[-4.9104, -28.5916, -49.3425, -76.0336], 1e-3);

        // obs0 = 4 reaches 6 at the last step
        let issafe = rollout.traj_issafe.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(issafe, vec![1.0, 1.0, 1.0, 0.0]);

        let final_obs = rollout.final_obs.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(final_obs, vec![3.0, 5.0, 6.0, 7.0]);

        let last_obs = rollout.last_obs.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(last_obs, vec![2.0, 4.0, 5.0, 6.0]);

        assert_eq!(rollout.c_sum.dims(), &[4, 1]);
        assert_eq!(rollout.c_mul.dims(), &[4, 1]);
        Ok(())
    }

    #[test]
    fn test_bootstrapped() -> Result<()> {
        let (estimator, model, obs, done) = setup(3)?;
        let rollout = estimator.run(policy, &model, &obs, &done, false)?;

        // V(x) = x
        let v_tail = rollout.final_obs.clone();
        let target = estimator.bootstrapped(&rollout, &v_tail)?;
        let target = target.flatten_all()?.to_vec1::<f32>()?;
        let expected: Vec<f32> = [(-4.9104f32, 3.0f32), (-28.5916, 5.0), (-49.3425, 6.0), (-76.0336, 7.0)]
            .iter()
            .map(|(r, o)| r + 0.970299 * o)
            .collect();
        assert_close(&target, &expected, 1e-3);
        Ok(())
    }

    #[test]
    fn test_transfer_sum_and_product() -> Result<()> {
        let (estimator, model, obs, done) = setup(2)?;
        let rollout = estimator.run(policy, &model, &obs, &done, false)?;

        let phi = ConstraintTransfer::default();
        let c0 = phi.forward(&(&obs - 5.0)?)?;
        let c1 = phi.forward(&(&obs - 4.0)?)?;
        let c_sum = (&c0 + &c1)?.flatten_all()?.to_vec1::<f32>()?;
        let c_mul = (&c0 * &c1)?.flatten_all()?.to_vec1::<f32>()?;

        assert_close(&rollout.c_sum.flatten_all()?.to_vec1::<f32>()?, &c_sum, 1e-6);
        assert_close(&rollout.c_mul.flatten_all()?.to_vec1::<f32>()?, &c_mul, 1e-6);
        Ok(())
    }

    #[test]
    fn test_runs_full_horizon_regardless_of_done() -> Result<()> {
        let (estimator, model, obs, done) = setup(7)?;
        let done = done.ones_like()?;
        estimator.run(policy, &model, &obs, &done, false)?;
        assert_eq!(model.calls.get(), 7);
        Ok(())
    }

    #[test]
    fn test_issafe_is_monotone() -> Result<()> {
        // Moves away from and then back into the safe region
        let estimator = RolloutEstimator::new(4, 0.99, 1.0, ConstraintTransfer::default());
        let model = LinearModel {
            calls: Cell::new(0),
        };
        let obs = Tensor::new(&[[4f32]], &Device::Cpu)?;
        let done = Tensor::zeros(1, DType::F32, &Device::Cpu)?;
        let policy = |o: &Tensor| -> Result<Tensor> {
            // +2 while below 5, then -3
            let up = o.lt(5.0)?.to_dtype(DType::F32)?;
            Ok(((up * 5.0)? - 3.0)?)
        };
        let rollout = estimator.run(policy, &model, &obs, &done, false)?;
        assert_eq!(model.calls.get(), 4);
        assert_eq!(rollout.traj_issafe.flatten_all()?.to_vec1::<f32>()?, vec![0.0]);
        Ok(())
    }

    #[test]
    fn test_discount_of_long_horizon() {
        let transfer = ConstraintTransfer::default();
        let estimator = RolloutEstimator::new(25, 0.99, 1.0, transfer);
        assert!((estimator.tail_discount() - 0.99f64.powi(25)).abs() < 1e-12);

        // Horizons beyond i32::MAX do not wrap into a negative exponent
        let horizon = i32::MAX as usize + 10;
        let estimator = RolloutEstimator::new(horizon, 0.99, 1.0, transfer);
        let d = estimator.tail_discount();
        assert!((0.0..=1.0).contains(&d), "{}", d);
    }

    #[test]
    fn test_zero_horizon_is_an_error() -> Result<()> {
        let (estimator, model, obs, done) = setup(0)?;
        assert!(estimator.run(policy, &model, &obs, &done, false).is_err());
        Ok(())
    }
}
