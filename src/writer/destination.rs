//! Destination backend sink.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};
use uuid::Uuid;

use super::RunSink;
use crate::backend::{DestinationClient, NewRun};
use crate::config::MigrationConfig;
use crate::experiment::tags::{
    DUAL_WRITE_EXPERIMENT_TAG, DUAL_WRITING_TAG, GROUP_PARENT_TAG, MIGRATED_FROM_PROJECT_TAG,
    RUN_BOOKKEEPING_TAGS, RUN_GROUP_TAG, SOURCE_PROJECT_NAME_TAG, SOURCE_RUN_ID_TAG,
    SOURCE_RUN_NAME_TAG, SOURCE_STATUS_TAG, TRUE_VALUE,
};
use crate::experiment::{Completion, ExperimentRecord, MetricPoint, RunDescriptor};
use crate::reconcile::ExistingRun;
use crate::{Error, Result};

/// Maximum params per `log_params` call.
pub const MAX_PARAMS_PER_BATCH: usize = 100;

/// Maximum metric points per `log_metrics` call.
pub const MAX_METRICS_PER_BATCH: usize = 1000;

/// Find or create the destination experiment for a project.
///
/// - `dual_writing_experiment_id` set: that experiment, tagged as a
///   dual-write target.
/// - An experiment with the target name already marked by a migration:
///   reused.
/// - Same name, unmarked: reused and marked when skip-existing is on,
///   otherwise a fresh `<name>_<6 hex>` experiment. Crash-resume never
///   adopts an unmarked experiment since its runs were not written by a
///   migration.
/// - No experiment: created, except under crash-resume where there is
///   nothing to resume.
///
/// `extra_tags` are merged into the experiment tags (e.g. staged project tags).
///
/// # Errors
///
/// Returns `Error::ExperimentNotFound` if a required experiment is
/// missing, or the backend error
pub fn resolve_experiment(
    client: &dyn DestinationClient,
    config: &MigrationConfig,
    extra_tags: &BTreeMap<String, String>,
) -> Result<ExperimentRecord> {
    let mut tags = extra_tags.clone();
    tags.insert(MIGRATED_FROM_PROJECT_TAG.to_string(), TRUE_VALUE.to_string());
    tags.insert(
        SOURCE_PROJECT_NAME_TAG.to_string(),
        config.project_name.clone(),
    );

    if let Some(experiment_id) = &config.dual_writing_experiment_id {
        let mut experiment = client
            .get_experiment(experiment_id)?
            .ok_or_else(|| Error::ExperimentNotFound(format!("id {experiment_id}")))?;
        tags.insert(DUAL_WRITE_EXPERIMENT_TAG.to_string(), TRUE_VALUE.to_string());
        client.set_experiment_tags(experiment_id, &tags)?;
        experiment.merge_tags(&tags);
        info!(experiment = %experiment.name(), "writing into dual-write experiment");
        return Ok(experiment);
    }

    let name = config.experiment_name();
    match client.get_experiment_by_name(name)? {
        Some(experiment) if experiment.is_migration_target() => {
            info!(experiment = %name, "reusing experiment from an earlier migration");
            Ok(experiment)
        }
        Some(_) if config.resume_from_crash => Err(Error::ExperimentNotFound(format!(
            "{name} exists but lacks the `{MIGRATED_FROM_PROJECT_TAG}` tag, so it holds no migration to resume"
        ))),
        Some(mut experiment) if config.skip_existing_runs => {
            info!(experiment = %name, "adopting existing experiment");
            client.set_experiment_tags(experiment.experiment_id(), &tags)?;
            experiment.merge_tags(&tags);
            Ok(experiment)
        }
        Some(_) => {
            let suffix = Uuid::new_v4().simple().to_string();
            let fresh = format!("{name}_{}", &suffix[..6]);
            info!(experiment = %name, created = %fresh, "experiment name taken, creating a new one");
            client.create_experiment(&fresh, &tags)
        }
        None if config.resume_from_crash => Err(Error::ExperimentNotFound(format!(
            "{name} (nothing to resume for project {})",
            config.project_name
        ))),
        None => {
            info!(experiment = %name, "creating experiment");
            client.create_experiment(name, &tags)
        }
    }
}

/// Writes runs into one destination experiment.
pub struct DestinationWriter<'a> {
    client: &'a dyn DestinationClient,
    experiment: ExperimentRecord,
    use_nested_run: bool,
    group_parents: HashMap<String, String>,
}

impl<'a> DestinationWriter<'a> {
    /// Resolve the experiment and prepare to write into it.
    ///
    /// # Errors
    ///
    /// See [`resolve_experiment`]
    pub fn open(
        client: &'a dyn DestinationClient,
        config: &MigrationConfig,
        extra_tags: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let experiment = resolve_experiment(client, config, extra_tags)?;
        Ok(Self {
            client,
            experiment,
            use_nested_run: config.use_nested_run,
            group_parents: HashMap::new(),
        })
    }

    /// Experiment being written.
    #[must_use]
    pub const fn experiment(&self) -> &ExperimentRecord {
        &self.experiment
    }

    /// Parent run standing in for a group, created on first use.
    fn group_parent(&mut self, group: &str) -> Result<String> {
        if let Some(run_id) = self.group_parents.get(group) {
            return Ok(run_id.clone());
        }
        let existing = self
            .client
            .list_runs(self.experiment.experiment_id())?
            .into_iter()
            .find(|run| run.is_group_parent() && run.name == group);
        let run_id = match existing {
            Some(run) => run.run_id,
            None => {
                let tags = BTreeMap::from([(GROUP_PARENT_TAG.to_string(), TRUE_VALUE.to_string())]);
                let run_id = self.client.create_run(&NewRun {
                    experiment_id: self.experiment.experiment_id(),
                    name: group,
                    parent_run_id: None,
                    tags: &tags,
                })?;
                self.client.mark_run_complete(&run_id, Completion::Complete)?;
                debug!(group, run_id = %run_id, "created group parent run");
                run_id
            }
        };
        self.group_parents.insert(group.to_string(), run_id.clone());
        Ok(run_id)
    }

    fn bookkeeping_tags(&self, run: &RunDescriptor) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::from([
            (SOURCE_RUN_ID_TAG.to_string(), run.run_id().to_string()),
            (SOURCE_RUN_NAME_TAG.to_string(), run.name().to_string()),
            (SOURCE_STATUS_TAG.to_string(), run.status().to_string()),
        ]);
        if let (Some(group), false) = (run.group(), self.use_nested_run) {
            tags.insert(RUN_GROUP_TAG.to_string(), group.to_string());
        }
        if run.is_dual_writing() {
            tags.insert(DUAL_WRITING_TAG.to_string(), TRUE_VALUE.to_string());
        }
        tags
    }

    /// Everything after run creation. Any failure leaves the run incomplete.
    fn fill(&self, run_id: &str, run: &RunDescriptor) -> Result<()> {
        let params: Vec<(String, String)> = run
            .params()
            .iter()
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect();
        for batch in params.chunks(MAX_PARAMS_PER_BATCH) {
            self.client.log_params(run_id, batch)?;
        }

        let points: Vec<(&str, MetricPoint)> = run
            .system_metrics()
            .iter()
            .chain(run.metrics())
            .flat_map(|(name, points)| points.iter().map(move |point| (name.as_str(), *point)))
            .collect();
        for batch in points.chunks(MAX_METRICS_PER_BATCH) {
            self.client.log_metrics(run_id, batch)?;
        }
        debug!(
            run = %run.name(),
            params = params.len(),
            points = points.len(),
            "logged params and metrics"
        );

        // Source tags must not shadow the keys reconciliation matches on.
        let source_tags: BTreeMap<String, String> = run
            .tags()
            .iter()
            .filter(|(key, _)| {
                let reserved =
                    RUN_BOOKKEEPING_TAGS.contains(&key.as_str()) || key.as_str() == GROUP_PARENT_TAG;
                if reserved {
                    debug!(run = %run.name(), tag = %key, "dropping source tag that collides with a bookkeeping tag");
                }
                !reserved
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.client.set_tags(run_id, &source_tags)?;
        self.client
            .mark_run_complete(run_id, run.status().completion())
    }
}

impl RunSink for DestinationWriter<'_> {
    fn existing_runs(&mut self) -> Result<Vec<ExistingRun>> {
        Ok(self
            .client
            .list_runs(self.experiment.experiment_id())?
            .into_iter()
            .filter(|run| !run.is_group_parent())
            .map(ExistingRun::from)
            .collect())
    }

    fn remove(&mut self, run: &ExistingRun) -> Result<()> {
        info!(run = %run.name, run_id = %run.run_id, "deleting incomplete run");
        self.client.delete_run(&run.run_id)
    }

    fn write(&mut self, run: &RunDescriptor) -> Result<ExistingRun> {
        let partial = |err: Error| Error::PartialWrite {
            run: run.name().to_string(),
            reason: err.to_string(),
        };

        let parent_run_id = match run.group() {
            Some(group) if self.use_nested_run => Some(self.group_parent(group).map_err(partial)?),
            _ => None,
        };
        let tags = self.bookkeeping_tags(run);
        let run_id = self
            .client
            .create_run(&NewRun {
                experiment_id: self.experiment.experiment_id(),
                name: run.name(),
                parent_run_id: parent_run_id.as_deref(),
                tags: &tags,
            })
            .map_err(partial)?;
        self.fill(&run_id, run).map_err(partial)?;

        Ok(ExistingRun {
            run_id,
            name: run.name().to_string(),
            source_run_id: Some(run.run_id().to_string()),
            complete: true,
            created_at: None,
        })
    }

    fn describe(&self) -> String {
        format!(
            "experiment {} ({})",
            self.experiment.name(),
            self.experiment.experiment_id()
        )
    }
}
