use std::time::Instant;

use opentelemetry::{Key, KeyValue, Value, metrics::Histogram};

/// Measures the duration of an operation into a histogram, in milliseconds.
///
/// ```ignore
/// use telemetry::metrics::{RATE_LIMIT_CHECK_DURATION, Recorder};
///
/// let mut recorder = Recorder::new(RATE_LIMIT_CHECK_DURATION);
///
/// let windows = check_windows().await;
///
/// recorder.push_attribute("windows", windows);
/// recorder.record();
/// ```
///
/// Nothing is recorded if the recorder is dropped without calling [`Recorder::record`],
/// so failed operations can bail out early without skewing the histogram.
pub struct Recorder {
    start: Instant,
    histogram: Histogram<f64>,
    attributes: Vec<KeyValue>,
}

impl Recorder {
    /// Starts timing against the histogram `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            histogram: super::meter().f64_histogram(name).with_unit("ms").build(),
            attributes: Vec::new(),
        }
    }

    /// Adds an attribute recorded with the measurement.
    pub fn push_attribute<K, V>(&mut self, key: K, value: V)
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        self.attributes.push(KeyValue::new(key, value));
    }

    /// Records the elapsed time.
    pub fn record(self) {
        let duration = self.start.elapsed().as_secs_f64() * 1000.0;
        self.histogram.record(duration, &self.attributes);
    }
}
