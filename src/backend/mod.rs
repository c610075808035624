//! Tracking backend clients
//!
//! The migration engine talks to both tracking systems through explicit
//! client handles passed in by the caller. There is no ambient session:
//! whoever owns the handles acquires and releases them around the whole
//! migration.
//!
//! - [`SourceClient`]: read side (projects, runs, configs, metric history)
//! - [`DestinationClient`]: write side (experiments, runs, params, metrics, tags)
//!
//! [`MemorySource`] and [`MemoryDestination`] are complete in-memory
//! implementations with fault injection, used by the test suite and demos.

mod memory;

pub use memory::{MemoryDestination, MemorySource, StoredRun};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::convert::HistoryRow;
use crate::experiment::tags::{GROUP_PARENT_TAG, SOURCE_RUN_ID_TAG};
use crate::experiment::{Completion, ExperimentRecord, MetricPoint, RunStatus};
use crate::Result;

/// Run summary as listed by the source backend.
///
/// Carries everything except metric history, which is fetched per run.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRun {
    /// Stable source-native identifier, unique within the project
    pub run_id: String,
    /// Display name
    pub name: String,
    /// Source grouping key
    pub group: Option<String>,
    /// Source status
    pub status: RunStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Run config (becomes params)
    pub config: Map<String, Value>,
    /// Run tags
    pub tags: BTreeMap<String, String>,
}

impl SourceRun {
    /// Create a finished run with an empty config, created now.
    #[must_use]
    pub fn new(run_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            name: name.into(),
            group: None,
            status: RunStatus::Finished,
            created_at: Utc::now(),
            config: Map::new(),
            tags: BTreeMap::new(),
        }
    }
}

/// Read access to the source tracking backend.
pub trait SourceClient: Send + Sync {
    /// List project names.
    fn list_projects(&self) -> Result<Vec<String>>;

    /// List run summaries in a project.
    fn list_runs(&self, project: &str) -> Result<Vec<SourceRun>>;

    /// Get one run summary.
    fn get_run(&self, project: &str, run_id: &str) -> Result<SourceRun>;

    /// Full experiment metric history of a run, in logging order.
    ///
    /// This is the dominant latency cost of a migration.
    fn metric_history(&self, project: &str, run_id: &str) -> Result<Vec<HistoryRow>>;

    /// System telemetry history of a run, in sampling order.
    fn system_metric_history(&self, project: &str, run_id: &str) -> Result<Vec<HistoryRow>>;

    /// Creation time of a run.
    fn run_created_at(&self, project: &str, run_id: &str) -> Result<DateTime<Utc>> {
        Ok(self.get_run(project, run_id)?.created_at)
    }

    /// Whether a project exists.
    fn has_project(&self, project: &str) -> Result<bool> {
        Ok(self.list_projects()?.iter().any(|p| p == project))
    }
}

/// A run already present at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRun {
    /// Destination-native identifier
    pub run_id: String,
    /// Run name
    pub name: String,
    /// Parent run, for nested runs
    pub parent_run_id: Option<String>,
    /// Run tags
    pub tags: BTreeMap<String, String>,
    /// Whether the migration of this run finished
    pub complete: bool,
    /// Creation time at the destination
    pub created_at: DateTime<Utc>,
}

impl DestinationRun {
    /// Source run id recorded at creation, if the run came from a migration.
    #[must_use]
    pub fn source_run_id(&self) -> Option<&str> {
        self.tags.get(SOURCE_RUN_ID_TAG).map(String::as_str)
    }

    /// Whether this run stands in for a source group.
    #[must_use]
    pub fn is_group_parent(&self) -> bool {
        self.tags.contains_key(GROUP_PARENT_TAG)
    }
}

/// Arguments for [`DestinationClient::create_run`].
#[derive(Debug, Clone, Copy)]
pub struct NewRun<'a> {
    /// Experiment to create the run in
    pub experiment_id: &'a str,
    /// Run name
    pub name: &'a str,
    /// Parent run for nesting
    pub parent_run_id: Option<&'a str>,
    /// Tags set atomically with creation
    pub tags: &'a BTreeMap<String, String>,
}

/// Write access to the destination tracking backend.
pub trait DestinationClient: Send + Sync {
    /// Get an experiment by id.
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<ExperimentRecord>>;

    /// Get an experiment by name.
    fn get_experiment_by_name(&self, name: &str) -> Result<Option<ExperimentRecord>>;

    /// Create an experiment with tags.
    fn create_experiment(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ExperimentRecord>;

    /// Merge tags into an experiment.
    fn set_experiment_tags(&self, experiment_id: &str, tags: &BTreeMap<String, String>)
        -> Result<()>;

    /// List runs in an experiment with their completion flags.
    fn list_runs(&self, experiment_id: &str) -> Result<Vec<DestinationRun>>;

    /// Create a run, returning its destination id.
    fn create_run(&self, run: &NewRun<'_>) -> Result<String>;

    /// Log a batch of params.
    fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()>;

    /// Log one metric point.
    fn log_metric(&self, run_id: &str, key: &str, point: MetricPoint) -> Result<()>;

    /// Log a batch of metric points, in order.
    fn log_metrics(&self, run_id: &str, batch: &[(&str, MetricPoint)]) -> Result<()> {
        for (key, point) in batch {
            self.log_metric(run_id, key, *point)?;
        }
        Ok(())
    }

    /// Set one run tag.
    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Set several run tags.
    fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in tags {
            self.set_tag(run_id, key, value)?;
        }
        Ok(())
    }

    /// Delete a run.
    fn delete_run(&self, run_id: &str) -> Result<()>;

    /// Mark a run as fully migrated, recording the source outcome.
    fn mark_run_complete(&self, run_id: &str, outcome: Completion) -> Result<()>;
}
