//! Separated PI controller of the Lagrange multipliers.
//!
//! The multiplier of constraint `d` follows the gap between the required
//! chance of staying safe, `chance_thre`, and the estimated one, `safe_prob[d]`:
//!
//! ```text
//! Δp  = chance_thre - safe_prob
//! Δi  = clamp(Δi + sep(Δp), 0, 99999)
//! Δd  = clamp(safe_prob_pre - safe_prob, 0, 3333)
//! lam = clamp(Ki Δi + Kp Δp + Kd Δd, 0, 3333)
//! ```
//!
//! `sep` is the integral separation ([`IntegralSeparation`]), which damps or
//! drops the integral contribution while the gap is large. The integral
//! accumulator never becomes negative, so a long period of over-satisfied
//! constraints does not wind the multiplier below zero.
//!
//! Two realizations exist. [`PiController::step`] is the closed-form
//! controller acting on the batch-level safety probability. The learned
//! realization regresses a multiplier network towards
//! [`PiController::network_target`], the same formula evaluated per state on
//! the outputs of the target networks.
use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use spil_core::error::SpilError;

/// Upper bound of the integral accumulator.
pub const INTEGRAL_UPPER_BOUND: f64 = 99999.0;

/// Upper bound of the multiplier and of the derivative term.
pub const MULTIPLIER_UPPER_BOUND: f64 = 3333.0;

/// Piecewise damping of the integral term.
///
/// With `a = |Δp|`, the integral increment is
/// `Δp * outer_factor` if `a > outer_band`, else `Δp * inner_factor` if
/// `a > inner_band`, else `Δp`. Comparisons are strict, a gap lying exactly
/// on a band boundary belongs to the band below it.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct IntegralSeparation {
    /// Lower edge of the damped band.
    pub inner_band: f64,

    /// Lower edge of the outer band.
    pub outer_band: f64,

    /// Factor applied in `(inner_band, outer_band]`.
    pub inner_factor: f64,

    /// Factor applied above `outer_band`.
    pub outer_factor: f64,
}

impl IntegralSeparation {
    /// Separation of the closed-form controller, the integral is frozen above the outer band.
    pub fn controller() -> Self {
        Self {
            inner_band: 0.1,
            outer_band: 0.2,
            inner_factor: 0.7,
            outer_factor: 0.0,
        }
    }

    /// Separation used for the targets of the multiplier network.
    pub fn network() -> Self {
        Self {
            outer_factor: 0.1,
            ..Self::controller()
        }
    }

    /// Returns the factor applied to the integral increment `delta_p`.
    pub fn factor(&self, delta_p: f64) -> f64 {
        let a = delta_p.abs();
        if a > self.outer_band {
            self.outer_factor
        } else if a > self.inner_band {
            self.inner_factor
        } else {
            1.0
        }
    }

    /// Returns the separated integral increment.
    pub fn separate(&self, delta_p: f64) -> f64 {
        delta_p * self.factor(delta_p)
    }

    /// Elementwise [`IntegralSeparation::separate`] on a tensor.
    pub fn separate_tensor(&self, delta_p: &Tensor) -> Result<Tensor> {
        let a = delta_p.abs()?;
        let in_inner = a.gt(self.inner_band)?.to_dtype(delta_p.dtype())?;
        let in_outer = a.gt(self.outer_band)?.to_dtype(delta_p.dtype())?;
        // Above the outer band both masks are set: 1 + (fi - 1) + (fo - fi) = fo
        let factor = (((in_inner * (self.inner_factor - 1.0))?
            + (in_outer * (self.outer_factor - self.inner_factor))?)?
            + 1.0)?;
        Ok(delta_p.mul(&factor)?)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0 <= self.inner_band && self.inner_band < self.outer_band) {
            return Err(SpilError::InvalidConfig(format!(
                "separation bands must satisfy 0 <= inner_band < outer_band, got {} and {}",
                self.inner_band, self.outer_band
            ))
            .into());
        }
        Ok(())
    }
}

impl Default for IntegralSeparation {
    fn default() -> Self {
        Self::controller()
    }
}

/// Gains of the PI(D) controller.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct PiGains {
    /// Proportional gain.
    pub kp: f64,

    /// Integral gain.
    pub ki: f64,

    /// Derivative gain, zero disables the derivative term.
    pub kd: f64,
}

impl Default for PiGains {
    fn default() -> Self {
        Self {
            kp: 40.0,
            ki: 0.07,
            kd: 0.0,
        }
    }
}

/// Configuration of [`PiController`].
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PiControllerConfig {
    /// Required probability of a rollout staying safe, shared by all constraints.
    pub chance_thre: f64,

    /// Controller gains.
    pub gains: PiGains,

    /// Integral separation of the closed-form controller.
    pub separation: IntegralSeparation,
}

impl Default for PiControllerConfig {
    fn default() -> Self {
        Self {
            chance_thre: 0.99,
            gains: PiGains::default(),
            separation: IntegralSeparation::controller(),
        }
    }
}

impl PiControllerConfig {
    /// Sets the required safety probability.
    pub fn chance_thre(mut self, v: f64) -> Self {
        self.chance_thre = v;
        self
    }

    /// Sets the controller gains.
    pub fn gains(mut self, kp: f64, ki: f64, kd: f64) -> Self {
        self.gains = PiGains { kp, ki, kd };
        self
    }

    /// Sets the integral separation.
    pub fn separation(mut self, v: IntegralSeparation) -> Self {
        self.separation = v;
        self
    }
}

/// Configuration of the learned multiplier realization.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MultiplierNetConfig {
    /// Integral separation used for the regression targets.
    pub separation: IntegralSeparation,

    /// If `true`, the proportional term is part of the regression target.
    pub proportional: bool,

    /// Where the target networks are evaluated.
    ///
    /// If `true`, on the observation fed to the last model step of the
    /// rollout ([`Rollout::last_obs`](super::Rollout::last_obs)). If `false`,
    /// on the observations of the batch, the states the online multiplier
    /// network is evaluated on.
    #[serde(default = "default_target_at_final_obs")]
    pub target_at_final_obs: bool,
}

fn default_target_at_final_obs() -> bool {
    true
}

impl Default for MultiplierNetConfig {
    fn default() -> Self {
        Self {
            separation: IntegralSeparation::network(),
            proportional: false,
            target_at_final_obs: true,
        }
    }
}

/// Which multiplier weights the constraint terms of the policy loss.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub enum MultiplierSource {
    /// The closed-form controller, one multiplier per constraint for the whole batch.
    ///
    /// The multiplier network is still trained in this mode, but its output
    /// does not reach the policy.
    Controller,

    /// The target multiplier network, one multiplier per state and constraint.
    Network,
}

impl Default for MultiplierSource {
    fn default() -> Self {
        Self::Controller
    }
}

/// State of the closed-form controller carried across gradient computations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DualState {
    /// Integral accumulator, in `[0, INTEGRAL_UPPER_BOUND]`.
    pub delta_i: Vec<f64>,

    /// Safety probability seen by the previous step.
    pub safe_prob_pre: Vec<f64>,

    /// Current multipliers, in `[0, MULTIPLIER_UPPER_BOUND]`.
    pub lam: Vec<f64>,
}

impl DualState {
    /// Zero state for `constraint_dim` constraints.
    pub fn new(constraint_dim: usize) -> Self {
        Self {
            delta_i: vec![0.0; constraint_dim],
            safe_prob_pre: vec![0.0; constraint_dim],
            lam: vec![0.0; constraint_dim],
        }
    }

    /// Returns the number of constraints.
    pub fn dim(&self) -> usize {
        self.lam.len()
    }
}

/// Separated PI controller.
#[derive(Debug, Clone)]
pub struct PiController {
    chance_thre: Vec<f64>,
    gains: PiGains,
    separation: IntegralSeparation,
}

impl PiController {
    /// Constructs the controller for `constraint_dim` constraints.
    pub fn new(config: &PiControllerConfig, constraint_dim: usize) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.chance_thre) {
            return Err(SpilError::InvalidConfig(format!(
                "chance_thre must be in [0, 1], got {}",
                config.chance_thre
            ))
            .into());
        }
        config.separation.validate()?;

        Ok(Self {
            chance_thre: vec![config.chance_thre; constraint_dim],
            gains: config.gains,
            separation: config.separation,
        })
    }

    /// Returns the required safety probability of each constraint.
    pub fn chance_thre(&self) -> &[f64] {
        &self.chance_thre
    }

    /// Returns the controller gains.
    pub fn gains(&self) -> &PiGains {
        &self.gains
    }

    /// Advances the controller with the estimated safety probabilities.
    ///
    /// `state` is left untouched; the returned state holds the new multipliers.
    /// Probabilities that are not finite or lie outside `[0, 1]` are rejected.
    pub fn step(&self, state: &DualState, safe_prob: &[f64]) -> Result<DualState> {
        let n = self.chance_thre.len();
        for (key, len) in [
            ("safe_prob", safe_prob.len()),
            ("delta_i", state.delta_i.len()),
            ("safe_prob_pre", state.safe_prob_pre.len()),
        ] {
            if len != n {
                return Err(SpilError::BatchShapeMismatch {
                    key: key.to_string(),
                    expected: format!("[{}]", n),
                    actual: vec![len],
                }
                .into());
            }
        }

        if let Some(p) = safe_prob.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            return Err(SpilError::InvalidConfig(format!(
                "safe_prob must be in [0, 1], got {}",
                p
            ))
            .into());
        }

        let PiGains { kp, ki, kd } = self.gains;
        let mut next = DualState::new(n);

        for d in 0..n {
            let delta_p = self.chance_thre[d] - safe_prob[d];
            let delta_i = (state.delta_i[d] + self.separation.separate(delta_p))
                .clamp(0.0, INTEGRAL_UPPER_BOUND);
            let delta_d = (state.safe_prob_pre[d] - safe_prob[d]).clamp(0.0, MULTIPLIER_UPPER_BOUND);

            next.delta_i[d] = delta_i;
            next.safe_prob_pre[d] = safe_prob[d];
            next.lam[d] = (ki * delta_i + kp * delta_p + kd * delta_d).clamp(0.0, MULTIPLIER_UPPER_BOUND);
        }

        Ok(next)
    }

    /// Regression target of the multiplier network.
    ///
    /// `prob_tgt` and `lam_tgt` are the outputs of the target probability and
    /// target multiplier networks, `(batch_size, constraint_dim)`, evaluated on
    /// the states selected by [`MultiplierNetConfig::target_at_final_obs`]. The target
    /// multiplier stands in for the integral accumulator of the state:
    ///
    /// ```text
    /// Δp(s)  = chance_thre - prob_tgt(s)
    /// Δi(s)  = clamp(lam_tgt(s) + sep(Δp(s)), 0, 99999)
    /// target = clamp(Ki Δi(s) [+ Kp Δp(s)], 0, 3333)
    /// ```
    pub fn network_target(
        &self,
        config: &MultiplierNetConfig,
        prob_tgt: &Tensor,
        lam_tgt: &Tensor,
    ) -> Result<Tensor> {
        let n = self.chance_thre.len();
        let thre: Vec<f32> = self.chance_thre.iter().map(|v| *v as f32).collect();
        let thre = Tensor::from_vec(thre, (1, n), prob_tgt.device())?;

        let delta_p = thre.broadcast_sub(&prob_tgt.detach())?;
        let sep = config.separation.separate_tensor(&delta_p)?;
        let delta_i = (lam_tgt.detach() + sep)?.clamp(0.0, INTEGRAL_UPPER_BOUND)?;
        let mut lam = (delta_i * self.gains.ki)?;
        if config.proportional {
            lam = (lam + (delta_p * self.gains.kp)?)?;
        }

        Ok(lam.clamp(0.0, MULTIPLIER_UPPER_BOUND)?.detach())
    }
}
