//! Migration pipeline
//!
//! ```text
//! Live:              source ──Fetcher──> Reconciler ──> DestinationWriter
//! DryRunExport:      source ──Fetcher──> Reconciler ──> StagingWriter
//! ResumeFromDryRun:  staging ─reader──> Reconciler ──> DestinationWriter
//! ```
//!
//! When fetching from the source, runs are reconciled from their listed
//! summaries first, so skipped runs never have their history fetched.
//! Everything after the fetch runs on the calling thread, one run at a
//! time.
//!
//! Per-run errors (see [`Error::is_run_level`]) are counted in the
//! summary and never abort the project. Project-level errors abort
//! immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::{DestinationClient, SourceClient};
use crate::config::{MigrationConfig, MigrationMode};
use crate::experiment::{MetricFilter, RunDescriptor, RunSelector};
use crate::fetch::Fetcher;
use crate::reconcile::{Action, Candidate, DestinationIndex, Reconciler, SkipReason};
use crate::staging::StagingStore;
use crate::writer::{DestinationWriter, RunSink, StagingWriter};
use crate::{Error, Result};

/// Outcome of migrating one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Source project
    pub project: String,
    /// Runs written fresh
    pub created: usize,
    /// Runs left untouched
    pub skipped: usize,
    /// Incomplete runs deleted and written again
    pub recreated: usize,
    /// Runs that failed with a per-run error
    pub failed: usize,
    /// Per-run errors and data warnings, in occurrence order
    pub warnings: Vec<String>,
    /// Wall-clock duration
    pub elapsed: Duration,
}

impl MigrationSummary {
    fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            ..Self::default()
        }
    }

    /// Runs considered, whatever happened to them.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.created + self.skipped + self.recreated + self.failed
    }

    /// Whether every considered run was written or deliberately skipped.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0
    }

    /// Count a per-run failure, or hand back a project-level error.
    fn absorb(&mut self, err: Error) -> Result<()> {
        if !err.is_run_level() {
            return Err(err);
        }
        warn!(project = %self.project, error = %err, "run failed");
        self.failed += 1;
        self.warnings.push(err.to_string());
        Ok(())
    }
}

impl fmt::Display for MigrationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "project {}: {} created, {} skipped, {} deleted and recreated, {} failed, {} warnings in {:.2}s",
            self.project,
            self.created,
            self.skipped,
            self.recreated,
            self.failed,
            self.warnings.len(),
            self.elapsed.as_secs_f64()
        )
    }
}

/// Migrates one project according to a validated configuration.
///
/// Backend handles are borrowed for the lifetime of the migrator; the
/// caller acquires and releases them around it.
pub struct Migrator<'a> {
    config: MigrationConfig,
    source: &'a dyn SourceClient,
    destination: Option<&'a dyn DestinationClient>,
    filter: MetricFilter,
    selector: RunSelector,
    reconciler: Reconciler,
}

impl<'a> Migrator<'a> {
    /// Validate the configuration and compile its patterns.
    ///
    /// No backend or filesystem access happens here.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigConflict`/`Error::InvalidConfig` from
    /// validation, or `Error::InvalidPattern` for a bad run-name or
    /// metric pattern
    pub fn new(config: MigrationConfig, source: &'a dyn SourceClient) -> Result<Self> {
        config.validate()?;
        let filter = MetricFilter::new(config.exclude_metrics.as_slice())?;
        let selector = RunSelector::new(config.run_names.as_slice())?;
        let reconciler = Reconciler::new(&config)?;
        Ok(Self {
            config,
            source,
            destination: None,
            filter,
            selector,
            reconciler,
        })
    }

    /// Attach the destination backend (required unless exporting).
    #[must_use]
    pub fn with_destination(mut self, destination: &'a dyn DestinationClient) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Run the migration.
    ///
    /// # Errors
    ///
    /// Returns project-level errors: missing project or experiment,
    /// missing destination client, staging root problems, or backend
    /// failures while listing
    pub fn run(&self) -> Result<MigrationSummary> {
        let started = Instant::now();
        let project = self.config.project_name.as_str();
        let mode = self.config.mode();
        let mut summary = MigrationSummary::new(project);
        info!(project, ?mode, "starting migration");

        match mode {
            MigrationMode::Live => {
                let destination = self.destination()?;
                self.ensure_source_project()?;
                let mut sink = DestinationWriter::open(destination, &self.config, &BTreeMap::new())?;
                self.migrate_from_source(&mut sink, &mut summary)?;
            }
            MigrationMode::DryRunExport => {
                self.ensure_source_project()?;
                let store = StagingStore::open(&self.config.dry_run_save_dir)?;
                let mut sink = StagingWriter::open(&store, &self.config)?;
                self.migrate_from_source(&mut sink, &mut summary)?;
            }
            MigrationMode::ResumeFromDryRun => {
                let destination = self.destination()?;
                let store = StagingStore::open(&self.config.dry_run_save_dir)?;
                if !store.has_project(project) {
                    return Err(Error::ProjectNotFound(format!(
                        "{project} (no staged data under {})",
                        store.root().display()
                    )));
                }
                let project_tags = store.project_tags(project)?;
                let mut sink = DestinationWriter::open(destination, &self.config, &project_tags)?;
                self.migrate_from_staging(&store, &mut sink, &mut summary)?;
            }
        }

        summary.elapsed = started.elapsed();
        info!(%summary, "migration finished");
        Ok(summary)
    }

    fn destination(&self) -> Result<&'a dyn DestinationClient> {
        self.destination.ok_or_else(|| {
            Error::InvalidConfig(
                "this mode writes to the destination, attach a client with `with_destination`"
                    .to_string(),
            )
        })
    }

    fn ensure_source_project(&self) -> Result<()> {
        let project = &self.config.project_name;
        if self.source.has_project(project)? {
            Ok(())
        } else {
            Err(Error::ProjectNotFound(project.clone()))
        }
    }

    fn migrate_from_source(&self, sink: &mut dyn RunSink, summary: &mut MigrationSummary) -> Result<()> {
        let project = self.config.project_name.as_str();
        let fetcher = Fetcher::new(
            self.source,
            &self.filter,
            &self.selector,
            self.config.dry_run_thread_pool_size,
        );
        let candidates = fetcher.list_candidates(project)?;
        let mut index = DestinationIndex::new(sink.existing_runs()?);
        debug!(sink = %sink.describe(), existing = index.len(), "indexed existing runs");

        let mut to_fetch = Vec::new();
        let mut actions = Vec::new();
        for run in candidates {
            match self.reconciler.plan(&Candidate::from(&run), &index) {
                Ok(Action::Skip(reason)) => record_skip(summary, &run.name, reason),
                Ok(action) => {
                    to_fetch.push(run);
                    actions.push(action);
                }
                Err(err) => summary.absorb(err)?,
            }
        }
        info!(
            project,
            runs = to_fetch.len(),
            workers = fetcher.pool_size(),
            "fetching runs"
        );

        fetcher.fetch_each(project, &to_fetch, |i, result| match result {
            Ok(run) => commit(sink, &mut index, &run, &actions[i], summary),
            Err(err) => summary.absorb(err),
        })
    }

    fn migrate_from_staging(
        &self,
        store: &StagingStore,
        sink: &mut dyn RunSink,
        summary: &mut MigrationSummary,
    ) -> Result<()> {
        let project = self.config.project_name.as_str();
        let mut runs = if self.config.ordered_by_creation_time {
            store.read_ordered(project, &self.filter, &self.selector, self.source)?
        } else {
            store.read(project, &self.filter)?.select(&self.selector)
        };
        let mut index = DestinationIndex::new(sink.existing_runs()?);
        debug!(sink = %sink.describe(), existing = index.len(), "indexed existing runs");

        for item in runs.by_ref() {
            let run = match item {
                Ok(run) => run,
                Err(err) => {
                    summary.absorb(err)?;
                    continue;
                }
            };
            match self.reconciler.plan(&Candidate::from(&run), &index) {
                Ok(action) => commit(sink, &mut index, &run, &action, summary)?,
                Err(err) => summary.absorb(err)?,
            }
        }
        for run_id in runs.incomplete() {
            summary
                .warnings
                .push(format!("staged run {run_id} is incomplete and was not imported"));
        }
        Ok(())
    }
}

fn record_skip(summary: &mut MigrationSummary, run: &str, reason: SkipReason) {
    info!(run, ?reason, "skipping run");
    summary.skipped += 1;
}

/// Apply one decision at the sink.
fn commit(
    sink: &mut dyn RunSink,
    index: &mut DestinationIndex,
    run: &RunDescriptor,
    action: &Action,
    summary: &mut MigrationSummary,
) -> Result<()> {
    let recreate = match action {
        Action::Skip(reason) => {
            record_skip(summary, run.name(), *reason);
            return Ok(());
        }
        Action::Create => false,
        Action::Recreate(existing) => {
            if let Err(err) = sink.remove(existing) {
                return summary.absorb(as_run_level(err, run));
            }
            index.remove(existing);
            true
        }
    };

    for metric in run.out_of_order_metrics() {
        summary
            .warnings
            .push(format!("run {}: metric {metric} has out-of-order points", run.name()));
    }

    match sink.write(run) {
        Ok(written) => {
            index.record(written);
            if recreate {
                summary.recreated += 1;
            } else {
                summary.created += 1;
            }
            info!(run = %run.name(), recreated = recreate, points = run.metric_point_count(), "migrated run");
            Ok(())
        }
        Err(err) => summary.absorb(as_run_level(err, run)),
    }
}

/// Sink failures while handling one run concern that run only.
fn as_run_level(err: Error, run: &RunDescriptor) -> Error {
    if err.is_run_level() {
        err
    } else {
        Error::PartialWrite {
            run: run.name().to_string(),
            reason: err.to_string(),
        }
    }
}
