//! Metric Point - one time-series sample of a run metric

use serde::{Deserialize, Serialize};

/// A single `(step, value, timestamp)` sample of a metric.
///
/// Points are kept in logging order. The engine never sorts or resamples
/// them; the ordered list per metric name is migrated exactly.
///
/// `timestamp` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    step: i64,
    value: f64,
    timestamp: i64,
}

impl MetricPoint {
    /// Create a new metric point.
    ///
    /// # Arguments
    ///
    /// * `step` - Training step or epoch number
    /// * `value` - Metric value
    /// * `timestamp` - Wall-clock time in milliseconds since the epoch
    #[must_use]
    pub const fn new(step: i64, value: f64, timestamp: i64) -> Self {
        Self {
            step,
            value,
            timestamp,
        }
    }

    /// Get the step/epoch number.
    #[must_use]
    pub const fn step(&self) -> i64 {
        self.step
    }

    /// Get the metric value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Get the timestamp in milliseconds.
    #[must_use]
    pub const fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Index of the first point whose step or timestamp goes backwards
/// relative to the point before it.
#[must_use]
pub fn first_out_of_order(points: &[MetricPoint]) -> Option<usize> {
    points
        .windows(2)
        .position(|pair| pair[1].step < pair[0].step || pair[1].timestamp < pair[0].timestamp)
        .map(|i| i + 1)
}
