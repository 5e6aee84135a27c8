use super::Record;

/// Writes a record to an output destination with [`Recorder::write`].
///
/// This is the telemetry sink of the library. Tensorboard or CSV writers live
/// outside of this workspace and implement this trait.
pub trait Recorder {
    /// Write a record to the [`Recorder`].
    fn write(&mut self, record: Record);
}

/// A [`Recorder`] that keeps records until they are flushed.
pub trait AggregateRecorder: Recorder {
    /// Store the record.
    fn store(&mut self, record: Record);

    /// Writes values aggregated from the stored records.
    ///
    /// `step` is written along with the aggregated values under the key `"opt_steps"`.
    fn flush(&mut self, step: i64);
}
