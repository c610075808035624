//! Source system telemetry rows → `system/...` metric series.
//!
//! System rows carry no wall-clock time, so each point uses its row
//! index as both step and timestamp.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use super::metrics::{numeric, HistoryRow};
use crate::experiment::MetricPoint;

#[derive(Debug, Clone, Copy)]
enum Unit {
    Unchanged,
    GigabytesToMegabytes,
    BytesToMegabytes,
}

impl Unit {
    fn apply(self, value: f64) -> f64 {
        match self {
            Self::Unchanged => value,
            Self::GigabytesToMegabytes => round2(value * 1000.0),
            Self::BytesToMegabytes => round2(value / 1_000_000.0),
        }
    }
}

/// Destination name, source column, unit conversion.
const HOST_METRICS: [(&str, &str, Unit); 7] = [
    ("system/cpu_utilization_percentage", "system.cpu", Unit::Unchanged),
    ("system/disk_usage_megabytes", "system.disk.\\.usageGB", Unit::GigabytesToMegabytes),
    ("system/disk_usage_percentage", "system.disk.\\.usagePercent", Unit::Unchanged),
    ("system/system_memory_usage_megabytes", "system.proc.memory.rssMB", Unit::Unchanged),
    ("system/system_memory_usage_percentage", "system.memory", Unit::Unchanged),
    ("system/network_receive_megabytes", "system.network.recv", Unit::BytesToMegabytes),
    ("system/network_transmit_megabytes", "system.network.sent", Unit::BytesToMegabytes),
];

fn gpu_key() -> &'static Regex {
    static GPU_KEY: OnceLock<Regex> = OnceLock::new();
    GPU_KEY.get_or_init(|| {
        Regex::new(
            r"^system\.gpu\.(\d+)\.(memory|memoryAllocated|memoryAllocatedBytes|powerWatts|powerPercent)$",
        )
        .unwrap_or_else(|_| unreachable!("GPU key pattern is a valid regex"))
    })
}

fn gpu_metric(key: &str) -> Option<(String, Unit)> {
    let captures = gpu_key().captures(key)?;
    let index = &captures[1];
    let (suffix, unit) = match &captures[2] {
        "memory" => ("utilization_percentage", Unit::Unchanged),
        "memoryAllocated" => ("memory_usage_percentage", Unit::Unchanged),
        "memoryAllocatedBytes" => ("memory_usage_megabytes", Unit::BytesToMegabytes),
        "powerWatts" => ("power_watts", Unit::Unchanged),
        "powerPercent" => ("power_percentage", Unit::Unchanged),
        _ => return None,
    };
    Some((format!("system/gpu_{index}_{suffix}"), unit))
}

/// Convert system telemetry rows into metric series.
#[must_use]
pub fn system_history_to_metrics(rows: &[HistoryRow]) -> BTreeMap<String, Vec<MetricPoint>> {
    let mut series: BTreeMap<String, Vec<MetricPoint>> = BTreeMap::new();
    for (index, row) in rows.iter().enumerate() {
        let step = i64::try_from(index).unwrap_or(i64::MAX);

        for (key, value) in row {
            let (Some((name, unit)), Some(value)) = (gpu_metric(key), numeric(value)) else {
                continue;
            };
            series
                .entry(name)
                .or_default()
                .push(MetricPoint::new(step, unit.apply(value), step));
        }

        for (name, column, unit) in HOST_METRICS {
            if let Some(value) = row.get(column).and_then(numeric) {
                series
                    .entry(name.to_string())
                    .or_default()
                    .push(MetricPoint::new(step, unit.apply(value), step));
            }
        }
    }
    series
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn row(value: Value) -> HistoryRow {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test rows are objects"),
        }
    }

    #[test]
    fn test_gpu_metrics_mapping() {
        let rows = vec![row(json!({
            "system.gpu.0.memory": 40.0,
            "system.gpu.1.memoryAllocatedBytes": 2_500_000_000_u64,
            "system.gpu.0.powerWatts": 250.5,
            "system.gpu.0.temp": 60.0,
        }))];
        let series = system_history_to_metrics(&rows);

        assert_eq!(
            series["system/gpu_0_utilization_percentage"],
            vec![MetricPoint::new(0, 40.0, 0)]
        );
        assert_eq!(
            series["system/gpu_1_memory_usage_megabytes"],
            vec![MetricPoint::new(0, 2500.0, 0)]
        );
        assert!(series.contains_key("system/gpu_0_power_watts"));
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn test_host_metrics_mapping_and_units() {
        let rows = vec![
            row(json!({"system.cpu": 12.5, "system.network.recv": 1_234_567})),
            row(json!({"system.cpu": 14.0, "system.disk.\\.usageGB": 1.2345})),
        ];
        let series = system_history_to_metrics(&rows);

        assert_eq!(
            series["system/cpu_utilization_percentage"],
            vec![MetricPoint::new(0, 12.5, 0), MetricPoint::new(1, 14.0, 1)]
        );
        assert_eq!(
            series["system/network_receive_megabytes"],
            vec![MetricPoint::new(0, 1.23, 0)]
        );
        assert_eq!(
            series["system/disk_usage_megabytes"],
            vec![MetricPoint::new(1, 1234.5, 1)]
        );
    }

    #[test]
    fn test_missing_values_are_skipped() {
        let rows = vec![row(json!({"system.cpu": null, "system.gpu.0.memory": null}))];
        assert!(system_history_to_metrics(&rows).is_empty());
    }
}
