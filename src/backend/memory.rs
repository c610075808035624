//! In-memory tracking backends using `DashMap`.
//!
//! Data is lost on process restart. Both backends support fault
//! injection so crash-resume paths can be exercised deterministically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};

use super::{DestinationClient, DestinationRun, NewRun, SourceClient, SourceRun};
use crate::convert::HistoryRow;
use crate::experiment::{Completion, ExperimentRecord, MetricPoint};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredSourceRun {
    run: SourceRun,
    history: Vec<HistoryRow>,
    system_history: Vec<HistoryRow>,
}

/// In-memory source backend.
///
/// Runs are listed in insertion order.
///
/// # Example
///
/// ```rust
/// use trueno_migrate::backend::{MemorySource, SourceClient, SourceRun};
///
/// let source = MemorySource::new();
/// source.add_project("demo");
/// source.add_run("demo", SourceRun::new("r1", "baseline"), vec![], vec![]);
///
/// assert_eq!(source.list_runs("demo").unwrap().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemorySource {
    projects: DashMap<String, Vec<StoredSourceRun>>,
    failing_runs: DashSet<String>,
    calls: AtomicUsize,
}

impl MemorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty project. No-op if it exists.
    pub fn add_project(&self, project: &str) {
        self.projects.entry(project.to_string()).or_default();
    }

    /// Add a run with its experiment and system metric history.
    pub fn add_run(
        &self,
        project: &str,
        run: SourceRun,
        history: Vec<HistoryRow>,
        system_history: Vec<HistoryRow>,
    ) {
        self.projects
            .entry(project.to_string())
            .or_default()
            .push(StoredSourceRun {
                run,
                history,
                system_history,
            });
    }

    /// Make history fetches for `run_id` fail until [`MemorySource::heal`].
    pub fn fail_fetches_for(&self, run_id: &str) {
        self.failing_runs.insert(run_id.to_string());
    }

    /// Stop failing fetches for `run_id`.
    pub fn heal(&self, run_id: &str) {
        self.failing_runs.remove(run_id);
    }

    /// Number of client calls served so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn stored(&self, project: &str, run_id: &str) -> Result<StoredSourceRun> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let runs = self
            .projects
            .get(project)
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;
        runs.iter()
            .find(|stored| stored.run.run_id == run_id)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("run {run_id} not found in {project}")))
    }

    fn history_of(&self, project: &str, run_id: &str) -> Result<StoredSourceRun> {
        if self.failing_runs.contains(run_id) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Backend(format!("injected fetch failure for {run_id}")));
        }
        self.stored(project, run_id)
    }
}

impl SourceClient for MemorySource {
    fn list_projects(&self) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut names: Vec<String> = self.projects.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn list_runs(&self, project: &str) -> Result<Vec<SourceRun>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let runs = self
            .projects
            .get(project)
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;
        Ok(runs.iter().map(|stored| stored.run.clone()).collect())
    }

    fn get_run(&self, project: &str, run_id: &str) -> Result<SourceRun> {
        Ok(self.stored(project, run_id)?.run)
    }

    fn metric_history(&self, project: &str, run_id: &str) -> Result<Vec<HistoryRow>> {
        Ok(self.history_of(project, run_id)?.history)
    }

    fn system_metric_history(&self, project: &str, run_id: &str) -> Result<Vec<HistoryRow>> {
        Ok(self.history_of(project, run_id)?.system_history)
    }
}

/// A run held by [`MemoryDestination`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    /// Owning experiment
    pub experiment_id: String,
    /// Run info, tags and completion flag
    pub run: DestinationRun,
    /// Logged params
    pub params: BTreeMap<String, String>,
    /// Logged metric points, in logging order
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    /// Outcome recorded when the run was marked complete
    pub outcome: Option<Completion>,
}

impl StoredRun {
    /// Total logged metric points.
    #[must_use]
    pub fn metric_point_count(&self) -> usize {
        self.metrics.values().map(Vec::len).sum()
    }
}

/// In-memory destination backend.
///
/// Thread-safe; ids are sequential so listing order is creation order.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    experiments: DashMap<String, ExperimentRecord>,
    runs: DashMap<String, StoredRun>,
    next_id: AtomicU64,
    failing_metric_runs: DashSet<String>,
    param_batches: AtomicUsize,
    metric_batches: AtomicUsize,
    deleted: AtomicUsize,
}

impl MemoryDestination {
    /// Create an empty destination.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make metric logging fail for runs named `run_name` until
    /// [`MemoryDestination::heal`].
    pub fn fail_metrics_for(&self, run_name: &str) {
        self.failing_metric_runs.insert(run_name.to_string());
    }

    /// Stop failing metric logging for `run_name`.
    pub fn heal(&self, run_name: &str) {
        self.failing_metric_runs.remove(run_name);
    }

    /// Insert a pre-existing run, e.g. left behind by an earlier process.
    ///
    /// # Errors
    ///
    /// Returns error if the experiment does not exist
    pub fn insert_run(&self, experiment_id: &str, name: &str, tags: BTreeMap<String, String>, complete: bool) -> Result<String> {
        let run_id = self.create_run(&NewRun {
            experiment_id,
            name,
            parent_run_id: None,
            tags: &tags,
        })?;
        if complete {
            self.mark_run_complete(&run_id, Completion::Complete)?;
        }
        Ok(run_id)
    }

    /// All runs of an experiment, in creation order.
    #[must_use]
    pub fn runs_in(&self, experiment_id: &str) -> Vec<StoredRun> {
        let mut runs: Vec<StoredRun> = self
            .runs
            .iter()
            .filter(|entry| entry.experiment_id == experiment_id)
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by(|a, b| a.run.run_id.cmp(&b.run.run_id));
        runs
    }

    /// First run with the given name in an experiment.
    #[must_use]
    pub fn run_by_name(&self, experiment_id: &str, name: &str) -> Option<StoredRun> {
        self.runs_in(experiment_id)
            .into_iter()
            .find(|stored| stored.run.name == name)
    }

    /// Number of experiments.
    #[must_use]
    pub fn experiment_count(&self) -> usize {
        self.experiments.len()
    }

    /// Number of `log_params` calls served.
    #[must_use]
    pub fn param_batch_count(&self) -> usize {
        self.param_batches.load(Ordering::SeqCst)
    }

    /// Number of metric logging calls served.
    #[must_use]
    pub fn metric_batch_count(&self) -> usize {
        self.metric_batches.load(Ordering::SeqCst)
    }

    /// Number of runs deleted.
    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    fn next_id(&self, prefix: &str) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{id:06}")
    }

    fn with_run<T>(&self, run_id: &str, f: impl FnOnce(&mut StoredRun) -> T) -> Result<T> {
        let mut stored = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::Backend(format!("run {run_id} does not exist")))?;
        Ok(f(stored.value_mut()))
    }

    fn check_metric_failure(&self, run_id: &str) -> Result<()> {
        let name = self.with_run(run_id, |stored| stored.run.name.clone())?;
        if self.failing_metric_runs.contains(&name) {
            return Err(Error::Backend(format!(
                "injected metric logging failure for {name}"
            )));
        }
        Ok(())
    }
}

impl DestinationClient for MemoryDestination {
    fn get_experiment(&self, experiment_id: &str) -> Result<Option<ExperimentRecord>> {
        Ok(self.experiments.get(experiment_id).map(|e| e.value().clone()))
    }

    fn get_experiment_by_name(&self, name: &str) -> Result<Option<ExperimentRecord>> {
        Ok(self
            .experiments
            .iter()
            .find(|entry| entry.name() == name)
            .map(|entry| entry.value().clone()))
    }

    fn create_experiment(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ExperimentRecord> {
        if self.get_experiment_by_name(name)?.is_some() {
            return Err(Error::Backend(format!("experiment {name} already exists")));
        }
        let mut experiment = ExperimentRecord::new(self.next_id("exp"), name);
        experiment.merge_tags(tags);
        self.experiments
            .insert(experiment.experiment_id().to_string(), experiment.clone());
        Ok(experiment)
    }

    fn set_experiment_tags(
        &self,
        experiment_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut experiment = self
            .experiments
            .get_mut(experiment_id)
            .ok_or_else(|| Error::Backend(format!("experiment {experiment_id} does not exist")))?;
        experiment.merge_tags(tags);
        Ok(())
    }

    fn list_runs(&self, experiment_id: &str) -> Result<Vec<DestinationRun>> {
        Ok(self
            .runs_in(experiment_id)
            .into_iter()
            .map(|stored| stored.run)
            .collect())
    }

    fn create_run(&self, run: &NewRun<'_>) -> Result<String> {
        if !self.experiments.contains_key(run.experiment_id) {
            return Err(Error::Backend(format!(
                "experiment {} does not exist",
                run.experiment_id
            )));
        }
        let run_id = self.next_id("run");
        let created_at: DateTime<Utc> = Utc::now();
        self.runs.insert(
            run_id.clone(),
            StoredRun {
                experiment_id: run.experiment_id.to_string(),
                run: DestinationRun {
                    run_id: run_id.clone(),
                    name: run.name.to_string(),
                    parent_run_id: run.parent_run_id.map(str::to_string),
                    tags: run.tags.clone(),
                    complete: false,
                    created_at,
                },
                params: BTreeMap::new(),
                metrics: BTreeMap::new(),
                outcome: None,
            },
        );
        Ok(run_id)
    }

    fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()> {
        self.param_batches.fetch_add(1, Ordering::SeqCst);
        self.with_run(run_id, |stored| {
            stored.params.extend(params.iter().cloned());
        })
    }

    fn log_metric(&self, run_id: &str, key: &str, point: MetricPoint) -> Result<()> {
        self.log_metrics(run_id, &[(key, point)])
    }

    fn log_metrics(&self, run_id: &str, batch: &[(&str, MetricPoint)]) -> Result<()> {
        self.check_metric_failure(run_id)?;
        self.metric_batches.fetch_add(1, Ordering::SeqCst);
        self.with_run(run_id, |stored| {
            for (key, point) in batch {
                stored
                    .metrics
                    .entry((*key).to_string())
                    .or_default()
                    .push(*point);
            }
        })
    }

    fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.with_run(run_id, |stored| {
            stored.run.tags.insert(key.to_string(), value.to_string());
        })
    }

    fn delete_run(&self, run_id: &str) -> Result<()> {
        self.runs
            .remove(run_id)
            .ok_or_else(|| Error::Backend(format!("run {run_id} does not exist")))?;
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mark_run_complete(&self, run_id: &str, outcome: Completion) -> Result<()> {
        self.with_run(run_id, |stored| {
            stored.run.complete = true;
            stored.outcome = Some(outcome);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_lists_in_insertion_order() {
        let source = MemorySource::new();
        source.add_run("demo", SourceRun::new("b", "second"), vec![], vec![]);
        source.add_run("demo", SourceRun::new("a", "first"), vec![], vec![]);

        let names: Vec<String> = source
            .list_runs("demo")
            .unwrap()
            .into_iter()
            .map(|run| run.name)
            .collect();
        assert_eq!(names, vec!["second", "first"]);
        assert!(source.has_project("demo").unwrap());
        assert!(!source.has_project("other").unwrap());
    }

    #[test]
    fn test_memory_source_fault_injection() {
        let source = MemorySource::new();
        source.add_run("demo", SourceRun::new("r1", "a"), vec![], vec![]);
        source.fail_fetches_for("r1");
        assert!(source.metric_history("demo", "r1").is_err());
        source.heal("r1");
        assert!(source.metric_history("demo", "r1").is_ok());
    }

    #[test]
    fn test_memory_destination_run_lifecycle() {
        let dest = MemoryDestination::new();
        let experiment = dest.create_experiment("demo", &BTreeMap::new()).unwrap();
        let run_id = dest
            .create_run(&NewRun {
                experiment_id: experiment.experiment_id(),
                name: "r1",
                parent_run_id: None,
                tags: &BTreeMap::new(),
            })
            .unwrap();

        dest.log_params(&run_id, &[("lr".into(), "0.1".into())]).unwrap();
        dest.log_metrics(&run_id, &[("loss", MetricPoint::new(0, 1.0, 10))])
            .unwrap();
        assert!(!dest.list_runs(experiment.experiment_id()).unwrap()[0].complete);

        dest.mark_run_complete(&run_id, Completion::Complete).unwrap();
        let stored = dest.run_by_name(experiment.experiment_id(), "r1").unwrap();
        assert!(stored.run.complete);
        assert_eq!(stored.metric_point_count(), 1);
        assert_eq!(stored.params["lr"], "0.1");

        dest.delete_run(&run_id).unwrap();
        assert!(dest.runs_in(experiment.experiment_id()).is_empty());
    }

    #[test]
    fn test_memory_destination_metric_failure() {
        let dest = MemoryDestination::new();
        let experiment = dest.create_experiment("demo", &BTreeMap::new()).unwrap();
        let run_id = dest
            .insert_run(experiment.experiment_id(), "r1", BTreeMap::new(), false)
            .unwrap();
        dest.fail_metrics_for("r1");
        assert!(dest
            .log_metric(&run_id, "loss", MetricPoint::new(0, 1.0, 0))
            .is_err());
    }

    #[test]
    fn test_duplicate_experiment_name_rejected() {
        let dest = MemoryDestination::new();
        dest.create_experiment("demo", &BTreeMap::new()).unwrap();
        assert!(dest.create_experiment("demo", &BTreeMap::new()).is_err());
        assert_eq!(dest.experiment_count(), 1);
    }
}
