//! Source history rows → experiment metric series.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::experiment::MetricPoint;

/// One row of a source run's history: column name → logged value.
pub type HistoryRow = Map<String, Value>;

/// Bookkeeping columns every history row carries; never metrics.
pub const RESERVED_HISTORY_KEYS: [&str; 3] = ["_timestamp", "_step", "_run_time"];

const TIMESTAMP_KEY: &str = "_timestamp";
const STEP_KEY: &str = "_step";

/// Convert history rows into metric series.
///
/// - `_timestamp` (seconds) becomes milliseconds, `_step` the step; a row
///   without `_step` uses its index.
/// - Only numeric values are metrics; strings, booleans, nulls and nested
///   values are skipped.
/// - `.` in a column name becomes `/`.
/// - A metric with exactly one point across the whole history is logged
///   at step 0, since its source step carries no meaning.
#[must_use]
pub fn history_to_metrics(rows: &[HistoryRow]) -> BTreeMap<String, Vec<MetricPoint>> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for row in rows {
        for (key, value) in row {
            if is_metric_column(key) && numeric(value).is_some() {
                *counts.entry(key.as_str()).or_default() += 1;
            }
        }
    }

    let mut series: BTreeMap<String, Vec<MetricPoint>> = BTreeMap::new();
    for (index, row) in rows.iter().enumerate() {
        let timestamp = row.get(TIMESTAMP_KEY).and_then(numeric).map_or(0, seconds_to_millis);
        let step = row
            .get(STEP_KEY)
            .and_then(numeric)
            .map_or_else(|| i64::try_from(index).unwrap_or(i64::MAX), truncate);

        for (key, value) in row {
            if !is_metric_column(key) {
                continue;
            }
            let Some(value) = numeric(value) else {
                continue;
            };
            let step = if counts.get(key.as_str()) == Some(&1) { 0 } else { step };
            series
                .entry(key.replace('.', "/"))
                .or_default()
                .push(MetricPoint::new(step, value, timestamp));
        }
    }
    series
}

fn is_metric_column(key: &str) -> bool {
    !RESERVED_HISTORY_KEYS.contains(&key)
}

pub(crate) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|x| !x.is_nan()),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn truncate(value: f64) -> i64 {
    value as i64
}

fn seconds_to_millis(seconds: f64) -> i64 {
    truncate(seconds * 1000.0)
}
