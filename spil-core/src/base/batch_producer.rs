//! Sources of transition batches.
use super::TransitionBatch;
use anyhow::Result;

/// Produces batches of transitions for gradient computation.
///
/// Replay buffers and on-policy samplers are implemented outside of this
/// library; the algorithm only sees them through this trait.
pub trait BatchProducer {
    /// Batch generated by the producer.
    type Batch: TransitionBatch;

    /// Constructs a batch of `size` transitions.
    fn batch(&mut self, size: usize) -> Result<Self::Batch>;
}
