//! Utilities.
use anyhow::{anyhow, Result};
use candle_core::Var;
use candle_nn::VarMap;
use log::trace;
use std::{collections::HashMap, sync::MutexGuard};
mod named_tensors;
pub use named_tensors::NamedTensors;

/// Interface for handling output dimensions.
pub trait OutDim {
    /// Returns the output dimension.
    fn get_out_dim(&self) -> usize;

    /// Sets the output dimension.
    fn set_out_dim(&mut self, v: usize);
}

/// Locks the variables of a [`VarMap`].
pub fn lock_vars(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("VarMap lock is poisoned"))
}

/// Apply soft update on variables.
///
/// Variables are identified by their names.
///
/// dest = tau * src + (1.0 - tau) * dest
///
/// With `tau == 1.0` the variables of `src` are copied into `dest`, the two
/// maps keep independent storage.
pub fn track(dest: &VarMap, src: &VarMap, tau: f64) -> Result<()> {
    trace!("track with tau = {}", tau);
    let dest = lock_vars(dest)?;
    let src = lock_vars(src)?;

    for (k_dest, v_dest) in dest.iter() {
        let v_src = src
            .get(k_dest)
            .ok_or_else(|| anyhow!("No variable '{}' in the source", k_dest))?;
        let t_src = v_src.as_tensor().detach();
        let t_dest = v_dest.as_tensor().detach();
        let t_dest = ((tau * &t_src)? + ((1.0 - tau) * &t_dest)?)?;
        v_dest.set(&t_dest)?;
    }

    Ok(())
}
