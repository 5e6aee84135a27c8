mod common;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::*;
use candle_nn::loss::mse;
use spil_candle_agent::{
    mlp::{Mlp, MlpConfig},
    spil::{
        ComponentKind, DualState, MultiplierNetConfig, MultiplierSource, PiController,
        PiControllerConfig, Rollout, Spil, SpilConfig, TensorBatch,
    },
    EnvModel,
};
use spil_core::{error::SpilError, GradientAlgorithm};
use std::{collections::HashMap, convert::TryFrom};

const RECORD_KEYS: [&str; 14] = [
    "loss_critic",
    "critic_avg_value",
    "loss_prob",
    "prob_avg_value",
    "loss_lamnet",
    "lamnet_avg_value",
    "loss_actor",
    "alg_time",
    "reward_sum_avg",
    "iteration",
    "safe_prob_0",
    "lambda_0",
    "safe_prob",
    "lambda",
];

#[test]
fn test_compute_gradient_safe_batch() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut agent = create_agent(config())?;
    let (grads, record) = agent.compute_gradient(&safe_batch()?, 1)?;

    for key in RECORD_KEYS.iter() {
        assert!(record.get(key).is_some(), "no {} in the record", key);
    }
    assert_eq!(record.get_scalar("iteration")?, 1.0);
    assert_eq!(record.get_array1("safe_prob")?, vec![1.0]);

    // Over-satisfied: the integral stays at zero, the multiplier is clamped at zero
    assert_eq!(agent.safe_prob(), &[1.0]);
    assert_eq!(agent.dual_state().delta_i, vec![0.0]);
    assert_eq!(agent.dual_state().lam, vec![0.0]);

    for kind in ComponentKind::ALL.iter() {
        assert!(!grads.get(*kind).is_empty(), "no gradient of {}", kind);
    }

    // The policy receives a gradient through the model rollout
    let policy_grad_norm: f32 = sorted(&grads.policy)?
        .iter()
        .flat_map(|(_, g)| g.iter().map(|x| x.abs()))
        .sum();
    assert!(policy_grad_norm > 0.0);
    Ok(())
}

#[test]
fn test_compute_gradient_unsafe_batch() -> Result<()> {
    let mut agent = create_agent(config())?;
    let (_, record) = agent.compute_gradient(&unsafe_batch()?, 7)?;

    assert_eq!(record.get_scalar("safe_prob_0")?, 0.0);
    assert_eq!(agent.safe_prob(), &[0.0]);

    // The gap 0.99 lies beyond the outer band: proportional term only
    let state = agent.dual_state();
    assert_eq!(state.delta_i, vec![0.0]);
    assert!((state.lam[0] - 40.0 * 0.99).abs() < 1e-9);
    assert!((record.get_scalar("lambda_0")? - 39.6).abs() < 1e-4);
    Ok(())
}

#[test]
fn test_integral_accumulates_in_small_gap() -> Result<()> {
    // One unsafe trajectory out of 20: gap of 0.04, within the inner band
    let mut obs = vec![0.0f32; 19];
    obs.push(10.0);
    let batch = batch(&obs)?;

    let mut agent = create_agent(config())?;
    agent.compute_gradient(&batch, 0)?;
    agent.compute_gradient(&batch, 1)?;

    let state = agent.dual_state();
    assert!((state.safe_prob_pre[0] - 0.95).abs() < 1e-6);
    assert!((state.delta_i[0] - 2.0 * 0.04).abs() < 1e-6);
    assert!((state.lam[0] - (0.07 * 0.08 + 40.0 * 0.04)).abs() < 1e-5);
    Ok(())
}

#[test]
fn test_multiplier_network_source() -> Result<()> {
    let config = config().multiplier_source(MultiplierSource::Network);
    let mut agent = create_agent(config)?;
    let batch = unsafe_batch()?;

    let multiplier = agent.multiplier(&batch.obs, &agent.dual_state().lam)?;
    assert_eq!(multiplier.dims(), &[4, 1]);
    assert!(flat(&multiplier)?.iter().all(|v| *v >= 0.0));

    let (grads, _) = agent.compute_gradient(&batch, 0)?;
    agent.apply_gradient(&grads)?;
    Ok(())
}

#[test]
fn test_policy_bootstrap() -> Result<()> {
    let batch = safe_batch()?;

    // Without multipliers the loss is the negated mean reward sum of the rollout
    let agent = create_agent(config())?;
    let multiplier = agent.multiplier(&batch.obs, &[0.0])?;
    let loss = agent.compute_loss_policy(&batch, &multiplier)?;
    let rollout = agent.rollout().run(
        |o| agent.networks().policy.forward(o),
        agent.env_model(),
        &batch.obs,
        &batch.done,
        false,
    )?;
    let r_mean = rollout.r_sum.mean_all()?.to_scalar::<f32>()?;
    assert!((loss.to_scalar::<f32>()? + r_mean).abs() < 1e-5);

    // With bootstrapping it matches the regression target of the value network
    let agent = create_agent(config().policy_bootstrap(true))?;
    let loss = agent.compute_loss_policy(&batch, &multiplier)?;
    let losses = agent.compute_loss_v(&batch)?;
    assert!((loss.to_scalar::<f32>()? + losses.reward_sum_avg).abs() < 1e-5);
    Ok(())
}

/// Rollout of the current policy without gradient tracking.
fn rollout<E: EnvModel>(agent: &Spil<E, Mlp, Mlp, Mlp, Mlp>, batch: &TensorBatch) -> Result<Rollout> {
    agent.rollout().run(
        |o| agent.networks().policy.forward(o),
        agent.env_model(),
        &batch.obs,
        &batch.done,
        false,
    )
}

/// `-mean(r_sum / (1 + Σ lam) + Σ_d c_mul[d] lam[d] / (1 + Σ lam))` with one row of `lam` per state.
fn weighted_policy_loss(rollout: &Rollout, lam: &[Vec<f64>]) -> Result<f64> {
    let r_sum = flat(&rollout.r_sum)?;
    let c_mul = rollout.c_mul.to_vec2::<f32>()?;
    assert_eq!(lam.len(), r_sum.len());

    let total: f64 = r_sum
        .iter()
        .zip(c_mul.iter())
        .zip(lam.iter())
        .map(|((r, c), lam)| {
            let denom = 1.0 + lam.iter().sum::<f64>();
            let constraint: f64 = c.iter().zip(lam.iter()).map(|(c, l)| *c as f64 * l).sum();
            (*r as f64 + constraint) / denom
        })
        .sum();
    Ok(-total / r_sum.len() as f64)
}

fn assert_close(x: f64, expected: f64) {
    assert!(
        (x - expected).abs() <= 1e-5 * (1.0 + expected.abs()),
        "{} != {}",
        x,
        expected
    );
}

#[test]
fn test_policy_loss_with_controller_multiplier() -> Result<()> {
    let batch = safe_batch()?;
    let agent = create_agent(config())?;
    let multiplier = agent.multiplier(&batch.obs, &[39.6])?;
    assert_eq!(multiplier.dims(), &[1, 1]);

    let loss = agent.compute_loss_policy(&batch, &multiplier)?.to_scalar::<f32>()? as f64;
    let rollout = rollout(&agent, &batch)?;
    let expected = weighted_policy_loss(&rollout, &vec![vec![39.6]; 4])?;
    assert_close(loss, expected);

    // The constraint term carries most of the weight
    let unweighted = weighted_policy_loss(&rollout, &vec![vec![0.0]; 4])?;
    assert!((expected - unweighted).abs() > 1e-3);
    Ok(())
}

#[test]
fn test_policy_loss_with_two_constraints() -> Result<()> {
    let batch = safe_batch()?;
    let config = SpilConfig::mlp(DIM_OBS, DIM_ACT, 2)
        .forward_step(FORWARD_STEP)
        .multiplier_source(MultiplierSource::Network);
    let agent: Spil<TwoConstraintModel, Mlp, Mlp, Mlp, Mlp> =
        Spil::build(config, TwoConstraintModel)?;
    let rollout = rollout(&agent, &batch)?;
    assert_eq!(rollout.c_mul.dims(), &[4, 2]);

    // Per-state multipliers
    let lam = vec![
        vec![1.0, 3.0],
        vec![0.0, 2.0],
        vec![5.0, 0.5],
        vec![0.25, 0.0],
    ];
    let multiplier = Tensor::new(
        &[[1f32, 3.0], [0.0, 2.0], [5.0, 0.5], [0.25, 0.0]],
        &Device::Cpu,
    )?;
    let loss = agent.compute_loss_policy(&batch, &multiplier)?.to_scalar::<f32>()? as f64;
    assert_close(loss, weighted_policy_loss(&rollout, &lam)?);

    // Multipliers of the target multiplier network
    let multiplier = agent.multiplier(&batch.obs, &[0.0, 0.0])?;
    assert_eq!(multiplier.dims(), &[4, 2]);
    let lam = multiplier
        .to_vec2::<f32>()?
        .into_iter()
        .map(|row| row.into_iter().map(f64::from).collect())
        .collect::<Vec<Vec<f64>>>();
    let loss = agent.compute_loss_policy(&batch, &multiplier)?.to_scalar::<f32>()? as f64;
    assert_close(loss, weighted_policy_loss(&rollout, &lam)?);
    Ok(())
}

/// Loss of the multiplier network with the target networks evaluated on `obs_tgt`.
fn lamnet_loss(agent: &Agent, obs: &Tensor, obs_tgt: &Tensor) -> Result<f32> {
    let networks = agent.networks();
    let controller = PiController::new(&PiControllerConfig::default(), DIM_CONSTRAINT)?;
    let target = controller.network_target(
        &MultiplierNetConfig::default(),
        &networks.prob.forward_tgt(obs_tgt)?,
        &networks.lamnet.forward_tgt(obs_tgt)?,
    )?;
    Ok(mse(&networks.lamnet.forward(obs)?, &target)?.to_scalar::<f32>()?)
}

#[test]
fn test_multiplier_target_evaluation_point() -> Result<()> {
    assert!(MultiplierNetConfig::default().target_at_final_obs);
    let batch = safe_batch()?;

    for at_final in [true, false].iter() {
        let multiplier_net = MultiplierNetConfig {
            target_at_final_obs: *at_final,
            ..MultiplierNetConfig::default()
        };
        let agent = create_agent(config().multiplier_net(multiplier_net))?;
        let rollout = rollout(&agent, &batch)?;

        let at_last = lamnet_loss(&agent, &batch.obs, &rollout.last_obs)?;
        let at_batch = lamnet_loss(&agent, &batch.obs, &batch.obs)?;
        assert_ne!(at_last, at_batch);

        let loss = agent.compute_loss_v(&batch)?.loss_lamnet.to_scalar::<f32>()?;
        let expected = if *at_final { at_last } else { at_batch };
        assert_close(loss as f64, expected as f64);
    }
    Ok(())
}

#[test]
fn test_empty_batch_keeps_dual_state() -> Result<()> {
    let mut agent = create_agent(config())?;
    agent.compute_gradient(&unsafe_batch()?, 0)?;
    let state = agent.dual_state().clone();

    let err = agent.compute_gradient(&batch(&[])?, 1).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SpilError>(),
        Some(SpilError::BatchShapeMismatch { key, .. }) if key == "obs"
    ));
    assert_eq!(agent.dual_state(), &state);
    assert!(agent.dual_state().lam.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn test_missing_batch_key() -> Result<()> {
    let batch = safe_batch()?;
    let mut map: HashMap<_, _> = [
        ("obs", batch.obs.clone()),
        ("act", batch.act.clone()),
        ("rew", batch.rew.clone()),
        ("obs2", batch.obs2.clone()),
        ("done", batch.done.clone()),
    ]
    .iter()
    .cloned()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let err = TensorBatch::try_from(map.clone()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SpilError>(),
        Some(SpilError::MissingBatchKey(k)) if k == "con"
    ));

    map.insert("con".to_string(), batch.con.clone());
    assert!(TensorBatch::try_from(map).is_ok());
    Ok(())
}

#[test]
fn test_failed_call_keeps_dual_state() -> Result<()> {
    let mut agent = create_agent(config())?;
    agent.compute_gradient(&unsafe_batch()?, 0)?;
    let state = agent.dual_state().clone();

    let mut batch = safe_batch()?;
    batch.done = Tensor::zeros(3, DType::F32, &Device::Cpu)?;
    let err = agent.compute_gradient(&batch, 1).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SpilError>(),
        Some(SpilError::BatchShapeMismatch { .. })
    ));
    assert_eq!(agent.dual_state(), &state);

    // A state of the wrong size is rejected
    assert!(agent.set_dual_state(DualState::new(2)).is_err());
    assert_eq!(agent.dual_state(), &state);
    Ok(())
}

#[test]
fn test_invalid_output_dim() {
    let mut config = config();
    config.lamnet_config.model_config = Some(MlpConfig::new(DIM_OBS, vec![8], 2));
    assert!(create_agent(config).is_err());
}
