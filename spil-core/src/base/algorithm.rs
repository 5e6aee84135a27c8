//! Gradient-based algorithm.
use super::TransitionBatch;
use crate::record::Record;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// An algorithm that turns batches into gradients and applies them.
///
/// The training loop owning the algorithm alternates
/// [`GradientAlgorithm::compute_gradient`] and
/// [`GradientAlgorithm::apply_gradient`]. Both take `&mut self`: at most one
/// call can be in flight per instance.
pub trait GradientAlgorithm<B: TransitionBatch> {
    /// Gradients of all trainable networks.
    type Gradients;

    /// Computes gradients on a batch.
    ///
    /// Returns the gradients together with telemetry of the call.
    fn compute_gradient(&mut self, batch: &B, iteration: usize)
        -> Result<(Self::Gradients, Record)>;

    /// Applies an optimization step with the given gradients.
    fn apply_gradient(&mut self, grads: &Self::Gradients) -> Result<()>;

    /// Save the parameters of the algorithm in the given directory.
    fn save_params(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Load the parameters of the algorithm from the given directory.
    fn load_params(&mut self, path: &Path) -> Result<()>;
}
