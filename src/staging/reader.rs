//! Read side of the staging store: staged runs back into descriptors.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{
    check_run_dir, read_series_dir, read_tags, StagingStore, METRICS_DIR, PARAMS_FILE,
    SYSTEM_METRICS_DIR, TAGS_FILE,
};
use crate::backend::SourceClient;
use crate::experiment::tags::{
    DUAL_WRITING_TAG, MIGRATION_COMPLETE_TAG, RUN_BOOKKEEPING_TAGS, RUN_GROUP_TAG,
    SOURCE_RUN_NAME_TAG, SOURCE_STATUS_TAG, TRUE_VALUE,
};
use crate::experiment::{MetricFilter, ParamValue, RunDescriptor, RunSelector, RunStatus};
use crate::{Error, Result};

#[derive(Debug)]
enum Entry {
    Run {
        run_id: String,
        created_at: Option<DateTime<Utc>>,
    },
    Failed(Error),
}

/// Lazy sequence of staged runs of one project.
///
/// Each item is read from disk only when requested. Incomplete run
/// directories are skipped as if they had never been exported, and
/// their ids collected in [`StagedRuns::incomplete`].
#[derive(Debug)]
pub struct StagedRuns<'a> {
    store: &'a StagingStore,
    project: String,
    filter: &'a MetricFilter,
    selector: Option<&'a RunSelector>,
    entries: std::vec::IntoIter<Entry>,
    incomplete: Vec<String>,
}

impl<'a> StagedRuns<'a> {
    /// Number of entries not yet yielded (incomplete ones included).
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    /// Only yield runs whose staged name the selector admits.
    ///
    /// The name comes from `tags.csv`; params and metrics of other runs
    /// are never read.
    #[must_use]
    pub fn select(mut self, selector: &'a RunSelector) -> Self {
        self.selector = selector.is_restricted().then_some(selector);
        self
    }

    /// Ids of incomplete run directories skipped so far.
    #[must_use]
    pub fn incomplete(&self) -> &[String] {
        &self.incomplete
    }

    fn admits(&self, dir: &Path, run_id: &str) -> bool {
        let Some(selector) = self.selector else {
            return true;
        };
        // Unreadable tags are reported by `read_run`.
        let Ok(tags) = read_tags(&dir.join(TAGS_FILE)) else {
            return true;
        };
        let admitted = tags
            .get(SOURCE_RUN_NAME_TAG)
            .map_or(true, |name| selector.admits(name));
        if !admitted {
            debug!(project = %self.project, run_id, "staged run not in allow-list, skipping");
        }
        admitted
    }
}

impl Iterator for StagedRuns<'_> {
    type Item = Result<RunDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.entries.next()? {
                Entry::Failed(err) => return Some(Err(err)),
                Entry::Run { run_id, created_at } => {
                    let dir = match self.store.run_dir(&self.project, &run_id) {
                        Ok(dir) => dir,
                        Err(err) => return Some(Err(err)),
                    };
                    if let Err(err) = check_run_dir(&dir) {
                        warn!(project = %self.project, run_id = %run_id, error = %err, "skipping incomplete staged run");
                        self.incomplete.push(run_id);
                        continue;
                    }
                    if !self.admits(&dir, &run_id) {
                        continue;
                    }
                    let result = self
                        .store
                        .read_run(&self.project, &run_id, self.filter, created_at)
                        .map_err(|err| {
                            if err.is_run_level() {
                                err
                            } else {
                                Error::StagingCorruption {
                                    path: dir,
                                    reason: err.to_string(),
                                }
                            }
                        });
                    return Some(result);
                }
            }
        }
    }
}

impl StagingStore {
    /// Stream a project's staged runs in run-id order.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProjectNotFound` if nothing was staged for `project`
    pub fn read<'a>(&'a self, project: &str, filter: &'a MetricFilter) -> Result<StagedRuns<'a>> {
        self.ensure_project(project)?;
        let entries = self
            .run_dirs(project)?
            .into_iter()
            .map(|(run_id, _)| Entry::Run {
                run_id,
                created_at: None,
            })
            .collect::<Vec<_>>();
        Ok(self.staged(project, filter, entries, Vec::new()))
    }

    /// Stream a project's staged runs admitted by `selector` in ascending
    /// creation-time order.
    ///
    /// Creation time is not staged, so it is looked up live from the
    /// source, one call per complete admitted run. A failed lookup yields
    /// an `Error::Fetch` item after all ordered runs.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProjectNotFound` if nothing was staged for `project`
    pub fn read_ordered<'a>(
        &'a self,
        project: &str,
        filter: &'a MetricFilter,
        selector: &'a RunSelector,
        source: &dyn SourceClient,
    ) -> Result<StagedRuns<'a>> {
        self.ensure_project(project)?;
        let unordered = self.staged(project, filter, Vec::new(), Vec::new()).select(selector);
        let mut timed = Vec::new();
        let mut failed = Vec::new();
        let mut incomplete = Vec::new();
        for (run_id, dir) in self.run_dirs(project)? {
            if let Err(err) = check_run_dir(&dir) {
                warn!(project, run_id = %run_id, error = %err, "skipping incomplete staged run");
                incomplete.push(run_id);
                continue;
            }
            if !unordered.admits(&dir, &run_id) {
                continue;
            }
            match source.run_created_at(project, &run_id) {
                Ok(created_at) => timed.push((created_at, run_id)),
                Err(err) => {
                    warn!(project, run_id = %run_id, error = %err, "could not look up creation time");
                    failed.push(Entry::Failed(Error::Fetch {
                        run: run_id,
                        reason: err.to_string(),
                    }));
                }
            }
        }
        timed.sort();
        debug!(project, runs = timed.len(), "ordered staged runs by creation time");

        let entries = timed
            .into_iter()
            .map(|(created_at, run_id)| Entry::Run {
                run_id,
                created_at: Some(created_at),
            })
            .chain(failed)
            .collect();
        Ok(self.staged(project, filter, entries, incomplete).select(selector))
    }

    /// Read one staged run.
    ///
    /// # Errors
    ///
    /// Returns `Error::StagingCorruption` if the directory is incomplete or
    /// a file cannot be parsed, `Error::MalformedRun` if the staged run has
    /// no name
    pub fn read_run(
        &self,
        project: &str,
        run_id: &str,
        filter: &MetricFilter,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<RunDescriptor> {
        let dir = self.run_dir(project, run_id)?;
        check_run_dir(&dir)?;
        let corrupt = |reason: String| Error::StagingCorruption {
            path: dir.clone(),
            reason,
        };

        let mut tags = read_tags(&dir.join(TAGS_FILE))?;
        if tags.get(MIGRATION_COMPLETE_TAG).map(String::as_str) != Some(TRUE_VALUE) {
            return Err(corrupt(format!("{TAGS_FILE} lacks {MIGRATION_COMPLETE_TAG}")));
        }
        let name = tags.get(SOURCE_RUN_NAME_TAG).cloned();
        let group = tags.get(RUN_GROUP_TAG).cloned();
        let status = tags
            .get(SOURCE_STATUS_TAG)
            .map(|s| s.parse::<RunStatus>())
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?
            .unwrap_or(RunStatus::Running);
        let dual_writing = tags.get(DUAL_WRITING_TAG).map(String::as_str) == Some(TRUE_VALUE);
        tags.retain(|key, _| !RUN_BOOKKEEPING_TAGS.contains(&key.as_str()));

        let params: BTreeMap<String, ParamValue> =
            serde_json::from_slice(&fs::read(dir.join(PARAMS_FILE))?)
                .map_err(|e| corrupt(format!("{PARAMS_FILE}: {e}")))?;

        let mut builder = RunDescriptor::builder()
            .run_id(run_id)
            .group(group)
            .params(params)
            .metrics(read_series_dir(&dir.join(METRICS_DIR))?)
            .system_metrics(read_series_dir(&dir.join(SYSTEM_METRICS_DIR))?)
            .tags(tags)
            .status(status)
            .created_at(created_at)
            .dual_writing(dual_writing);
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder.build(filter)
    }

    fn ensure_project(&self, project: &str) -> Result<()> {
        if self.has_project(project) {
            Ok(())
        } else {
            Err(Error::ProjectNotFound(format!(
                "{project} (no staged data under {})",
                self.root().display()
            )))
        }
    }

    fn staged<'a>(
        &'a self,
        project: &str,
        filter: &'a MetricFilter,
        entries: Vec<Entry>,
        incomplete: Vec<String>,
    ) -> StagedRuns<'a> {
        StagedRuns {
            store: self,
            project: project.to_string(),
            filter,
            selector: None,
            entries: entries.into_iter(),
            incomplete,
        }
    }
}
