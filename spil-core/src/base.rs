//! Interfaces to the collaborators of the algorithm.
mod algorithm;
mod batch;
mod batch_producer;
pub use algorithm::GradientAlgorithm;
pub use batch::TransitionBatch;
pub use batch_producer::BatchProducer;
