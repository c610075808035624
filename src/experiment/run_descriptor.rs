//! Run Descriptor - backend-agnostic snapshot of one source run

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::metric_record::first_out_of_order;
use super::{MetricFilter, MetricPoint, ParamValue};
use crate::{Error, Result};

/// Status of a run at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run is still executing (or never reported an end).
    Running,
    /// Run completed successfully.
    Finished,
    /// Run failed or lost its heartbeat.
    Crashed,
    /// Run was stopped by user or system.
    Killed,
}

/// Destination-side view of a source status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Completion {
    /// Source run finished.
    Complete,
    /// Source run is running, crashed or was killed.
    Incomplete,
}

impl RunStatus {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Crashed => "crashed",
            Self::Killed => "killed",
        }
    }

    /// Collapse to the destination's two-valued status.
    #[must_use]
    pub const fn completion(self) -> Completion {
        match self {
            Self::Finished => Completion::Complete,
            Self::Running | Self::Crashed | Self::Killed => Completion::Incomplete,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "crashed" | "failed" => Ok(Self::Crashed),
            "killed" => Ok(Self::Killed),
            other => Err(Error::MalformedRun(format!("unknown run status `{other}`"))),
        }
    }
}

/// Immutable description of one run, ready for reconciliation and writing.
///
/// ## Invariants
///
/// - `run_id` and `name` are non-empty.
/// - No metric name matched by the exclusion filter in effect at
///   construction time is present.
/// - Metric point order is logging order; out-of-order points are kept
///   and their metric names reported by [`RunDescriptor::out_of_order_metrics`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunDescriptor {
    run_id: String,
    name: String,
    group: Option<String>,
    params: BTreeMap<String, ParamValue>,
    metrics: BTreeMap<String, Vec<MetricPoint>>,
    system_metrics: BTreeMap<String, Vec<MetricPoint>>,
    tags: BTreeMap<String, String>,
    status: RunStatus,
    created_at: Option<DateTime<Utc>>,
    dual_writing: bool,
    out_of_order: BTreeSet<String>,
}

impl RunDescriptor {
    /// Start building a descriptor.
    #[must_use]
    pub fn builder() -> RunDescriptorBuilder {
        RunDescriptorBuilder::default()
    }

    /// Source-native run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Display name, used as the destination run name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source grouping key, if any.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Run parameters.
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    /// Experiment metrics, by name, in logging order.
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, Vec<MetricPoint>> {
        &self.metrics
    }

    /// System telemetry metrics, by name, in logging order.
    #[must_use]
    pub const fn system_metrics(&self) -> &BTreeMap<String, Vec<MetricPoint>> {
        &self.system_metrics
    }

    /// Source run tags.
    #[must_use]
    pub const fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Source status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Creation time, when known.
    #[must_use]
    pub const fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Whether another process already writes this run to the destination.
    #[must_use]
    pub const fn is_dual_writing(&self) -> bool {
        self.dual_writing
    }

    /// Names of metrics (experiment or system) whose points go backwards.
    #[must_use]
    pub const fn out_of_order_metrics(&self) -> &BTreeSet<String> {
        &self.out_of_order
    }

    /// Total number of metric points, system metrics included.
    #[must_use]
    pub fn metric_point_count(&self) -> usize {
        self.metrics
            .values()
            .chain(self.system_metrics.values())
            .map(Vec::len)
            .sum()
    }
}

/// Builder for `RunDescriptor`.
///
/// Validation and metric exclusion both happen in [`RunDescriptorBuilder::build`].
#[derive(Debug, Default)]
pub struct RunDescriptorBuilder {
    run_id: Option<String>,
    name: Option<String>,
    group: Option<String>,
    params: BTreeMap<String, ParamValue>,
    metrics: BTreeMap<String, Vec<MetricPoint>>,
    system_metrics: BTreeMap<String, Vec<MetricPoint>>,
    tags: BTreeMap<String, String>,
    status: Option<RunStatus>,
    created_at: Option<DateTime<Utc>>,
    dual_writing: bool,
}

impl RunDescriptorBuilder {
    /// Set the source run id.
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the grouping key. Empty groups are ignored.
    #[must_use]
    pub fn group(mut self, group: Option<String>) -> Self {
        self.group = group.filter(|g| !g.is_empty());
        self
    }

    /// Add one parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add parameters.
    #[must_use]
    pub fn params(mut self, params: impl IntoIterator<Item = (String, ParamValue)>) -> Self {
        self.params.extend(params);
        self
    }

    /// Append points to an experiment metric.
    #[must_use]
    pub fn metric(mut self, name: impl Into<String>, points: impl IntoIterator<Item = MetricPoint>) -> Self {
        self.metrics.entry(name.into()).or_default().extend(points);
        self
    }

    /// Add experiment metric series.
    #[must_use]
    pub fn metrics(mut self, series: impl IntoIterator<Item = (String, Vec<MetricPoint>)>) -> Self {
        for (name, points) in series {
            self.metrics.entry(name).or_default().extend(points);
        }
        self
    }

    /// Add system metric series.
    #[must_use]
    pub fn system_metrics(
        mut self,
        series: impl IntoIterator<Item = (String, Vec<MetricPoint>)>,
    ) -> Self {
        for (name, points) in series {
            self.system_metrics.entry(name).or_default().extend(points);
        }
        self
    }

    /// Add one tag.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add tags.
    #[must_use]
    pub fn tags(mut self, tags: impl IntoIterator<Item = (String, String)>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Set the source status. Defaults to `Running` when unset.
    #[must_use]
    pub const fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the creation time.
    #[must_use]
    pub const fn created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark the run as dual-written.
    #[must_use]
    pub const fn dual_writing(mut self, dual_writing: bool) -> Self {
        self.dual_writing = dual_writing;
        self
    }

    /// Validate, drop excluded metrics and freeze the descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedRun` if `run_id` or `name` is missing or empty
    pub fn build(self, filter: &MetricFilter) -> Result<RunDescriptor> {
        let run_id = self
            .run_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::MalformedRun("run has no run_id".to_string()))?;
        let name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| Error::MalformedRun(format!("run {run_id} has no name")))?;

        let metrics = retain_included(self.metrics, filter);
        let system_metrics = retain_included(self.system_metrics, filter);

        let mut out_of_order = BTreeSet::new();
        for (metric, points) in metrics.iter().chain(system_metrics.iter()) {
            if let Some(index) = first_out_of_order(points) {
                warn!(
                    run = %name,
                    metric = %metric,
                    index,
                    "metric points go backwards in step or timestamp, keeping source order"
                );
                out_of_order.insert(metric.clone());
            }
        }

        Ok(RunDescriptor {
            run_id,
            name,
            group: self.group,
            params: self.params,
            metrics,
            system_metrics,
            tags: self.tags,
            status: self.status.unwrap_or(RunStatus::Running),
            created_at: self.created_at,
            dual_writing: self.dual_writing,
            out_of_order,
        })
    }
}

fn retain_included(
    mut series: BTreeMap<String, Vec<MetricPoint>>,
    filter: &MetricFilter,
) -> BTreeMap<String, Vec<MetricPoint>> {
    if !filter.is_empty() {
        series.retain(|name, _| !filter.is_excluded(name));
    }
    series
}
