#![warn(missing_docs)]
//! Core of the SPIL (separated proportional-integral Lagrangian) library.
//!
//! This crate holds everything that does not depend on a tensor backend:
//! telemetry [`record`]s and the recorders consuming them, the library
//! [`error`] type, and the narrow interfaces through which the algorithm
//! talks to its collaborators (batch producers and the training loop).
pub mod error;
pub mod record;

mod base;
pub use base::{BatchProducer, GradientAlgorithm, TransitionBatch};
