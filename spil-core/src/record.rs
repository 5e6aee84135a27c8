//! Telemetry records and the sinks consuming them.
//!
//! Every call of the gradient computer rebuilds a [`Record`], a map from metric
//! names to [`RecordValue`]s. Records are handed to a [`Recorder`]; recorders
//! implementing [`AggregateRecorder`] additionally buffer records and reduce
//! them when flushed.
//!
//! ```rust
//! use spil_core::record::{Record, RecordValue};
//!
//! let mut record = Record::from_scalar("loss_critic", 0.25);
//! record.insert("safe_prob", RecordValue::Array1(vec![0.98, 1.0]));
//! assert_eq!(record.get_scalar("loss_critic").unwrap(), 0.25);
//! ```
mod base;
mod buffered_recorder;
mod recorder;

pub use base::{Record, RecordValue};
pub use buffered_recorder::BufferedRecorder;
pub use recorder::{AggregateRecorder, Recorder};
