use super::lock_vars;
use anyhow::Result;
use candle_core::{backprop::GradStore, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;

/// Tensors keyed by the names of the variables they belong to.
///
/// Used for gradients handed from the gradient computer to the optimizers and
/// for snapshots of parameters.
#[derive(Clone, Debug, Default)]
pub struct NamedTensors {
    /// Tensors keyed by variable names.
    pub named_tensors: HashMap<String, Tensor>,
}

impl NamedTensors {
    /// Copy data of [`VarMap`].
    pub fn copy_from(vs: &VarMap) -> Result<Self> {
        let vars = lock_vars(vs)?;
        let mut named_tensors = HashMap::with_capacity(vars.len());
        for (k, v) in vars.iter() {
            named_tensors.insert(k.clone(), v.as_tensor().detach().copy()?);
        }
        Ok(Self { named_tensors })
    }

    /// Copy named tensors to [`VarMap`].
    pub fn copy_to(&self, vs: &VarMap) -> Result<()> {
        let vars = lock_vars(vs)?;
        for (name, src) in self.named_tensors.iter() {
            if let Some(dest) = vars.get(name) {
                dest.set(src)?;
            }
        }
        Ok(())
    }

    /// Collects gradients of the variables in `vs`.
    ///
    /// A variable that did not take part in the backward pass gets a zero gradient.
    pub fn from_grads(vs: &VarMap, grads: &GradStore) -> Result<Self> {
        let vars = lock_vars(vs)?;
        let mut named_tensors = HashMap::with_capacity(vars.len());
        for (k, v) in vars.iter() {
            let g = match grads.get(v.as_tensor()) {
                Some(g) => g.detach(),
                None => v.as_tensor().zeros_like()?,
            };
            named_tensors.insert(k.clone(), g);
        }
        Ok(Self { named_tensors })
    }

    /// Returns the tensor of the given name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.named_tensors.get(name)
    }

    /// Returns the number of tensors.
    pub fn len(&self) -> usize {
        self.named_tensors.len()
    }

    /// Returns `true` if there is no tensor.
    pub fn is_empty(&self) -> bool {
        self.named_tensors.is_empty()
    }

    /// Iterates over names and tensors.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.named_tensors.iter()
    }
}
