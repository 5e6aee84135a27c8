//! Batch.

/// Represents a batch of transitions with constraint signals.
///
/// All entries share the leading batch dimension.
pub trait TransitionBatch {
    /// A set of observations in a batch.
    type ObsBatch;

    /// A set of actions in a batch.
    type ActBatch;

    /// A set of per-sample values, e.g., rewards or done flags.
    type ValueBatch;

    /// Unpack the data `(o_t, a_t, r_t, c_t, o_t+1, is_done_t)`.
    #[allow(clippy::type_complexity)]
    fn unpack(
        self,
    ) -> (
        Self::ObsBatch,
        Self::ActBatch,
        Self::ValueBatch,
        Self::ValueBatch,
        Self::ObsBatch,
        Self::ValueBatch,
    );

    /// Returns the number of transitions.
    fn len(&self) -> usize;

    /// Returns `true` if the batch has no transition.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `o_t`.
    fn obs(&self) -> &Self::ObsBatch;

    /// Returns `a_t`.
    fn act(&self) -> &Self::ActBatch;

    /// Returns `r_t`.
    fn reward(&self) -> &Self::ValueBatch;

    /// Returns the constraint values `c_t`, one column per constraint.
    fn constraint(&self) -> &Self::ValueBatch;

    /// Returns `o_t+1`.
    fn next_obs(&self) -> &Self::ObsBatch;

    /// Returns `is_done_t`.
    fn is_done(&self) -> &Self::ValueBatch;
}
