use super::{AggregateRecorder, Record, RecordValue, Recorder};
use std::collections::HashMap;

/// Buffered recorder.
///
/// Written records are kept in memory. Stored records are averaged key by key
/// on [`AggregateRecorder::flush`] and the result is written to the buffer.
/// Only scalars are averaged; for other values the latest one is kept.
#[derive(Default)]
pub struct BufferedRecorder {
    buf: Vec<Record>,
    storage: Vec<Record>,
}

impl BufferedRecorder {
    /// Construct the recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an iterator over the written records.
    pub fn iter(&self) -> std::slice::Iter<Record> {
        self.buf.iter()
    }

    /// Returns the number of written records.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if no record has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn aggregate(records: &[Record]) -> Record {
        let mut sums: HashMap<&str, (f32, usize)> = HashMap::new();
        let mut record = Record::empty();

        for r in records.iter() {
            for (k, v) in r.iter() {
                match v {
                    RecordValue::Scalar(x) => {
                        let e = sums.entry(k.as_str()).or_insert((0.0, 0));
                        e.0 += x;
                        e.1 += 1;
                    }
                    _ => record.insert(k.clone(), v.clone()),
                }
            }
        }

        for (k, (sum, n)) in sums.into_iter() {
            record.insert(k, RecordValue::Scalar(sum / n as f32));
        }

        record
    }
}

impl Recorder for BufferedRecorder {
    fn write(&mut self, record: Record) {
        self.buf.push(record);
    }
}

impl AggregateRecorder for BufferedRecorder {
    fn store(&mut self, record: Record) {
        self.storage.push(record);
    }

    fn flush(&mut self, step: i64) {
        if self.storage.is_empty() {
            return;
        }

        let mut record = Self::aggregate(&self.storage);
        record.insert("opt_steps", RecordValue::Scalar(step as f32));
        self.storage.clear();
        self.write(record);
    }
}
