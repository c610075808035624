//! Reconciler - per-run create/skip/recreate decisions
//!
//! Decides what happens to each candidate run before it reaches a sink,
//! given the runs already present there:
//!
//! | present at sink     | skip_existing | resume_from_crash | action            |
//! |---------------------|---------------|-------------------|-------------------|
//! | absent              | -             | -                 | create            |
//! | complete            | true          | -                 | skip              |
//! | incomplete          | true          | -                 | skip              |
//! | complete            | -             | true              | skip              |
//! | incomplete          | -             | true              | delete, create    |
//! | any                 | false         | false             | `ExistingRun` err |
//!
//! Dual-writing runs are skipped first when `skip_dual_writing_runs` is
//! set, whatever the sink holds.
//!
//! Runs at the sink are matched by the `source_run_id` tag recorded at
//! creation, so a run renamed at the source since an earlier partial
//! migration is still recognised. Runs without that tag fall back to
//! matching by name.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::backend::{DestinationRun, SourceRun};
use crate::config::MigrationConfig;
use crate::convert::is_dual_writing;
use crate::experiment::RunDescriptor;
use crate::{Error, Result};

/// A run already present at a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingRun {
    /// Sink-native id (destination run id, or staging directory name)
    pub run_id: String,
    /// Run name
    pub name: String,
    /// Source run id it was created from, when recorded
    pub source_run_id: Option<String>,
    /// Whether the migration of this run finished
    pub complete: bool,
    /// Creation time at the sink, when known
    pub created_at: Option<DateTime<Utc>>,
}

impl From<DestinationRun> for ExistingRun {
    fn from(run: DestinationRun) -> Self {
        Self {
            source_run_id: run.source_run_id().map(str::to_string),
            run_id: run.run_id,
            name: run.name,
            complete: run.complete,
            created_at: Some(run.created_at),
        }
    }
}

/// Identity of a run being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate<'a> {
    /// Source run id
    pub run_id: &'a str,
    /// Source run name
    pub name: &'a str,
    /// Whether the source run already writes to the destination itself
    pub dual_writing: bool,
}

impl<'a> From<&'a RunDescriptor> for Candidate<'a> {
    fn from(run: &'a RunDescriptor) -> Self {
        Self {
            run_id: run.run_id(),
            name: run.name(),
            dual_writing: run.is_dual_writing(),
        }
    }
}

impl<'a> From<&'a SourceRun> for Candidate<'a> {
    fn from(run: &'a SourceRun) -> Self {
        Self {
            run_id: &run.run_id,
            name: &run.name,
            dual_writing: is_dual_writing(&run.config),
        }
    }
}

/// Runs present at a sink, keyed for lookup by candidate.
#[derive(Debug, Default)]
pub struct DestinationIndex {
    by_source_id: HashMap<String, ExistingRun>,
    by_name: HashMap<String, ExistingRun>,
}

impl DestinationIndex {
    /// Index existing runs. When two runs share a key the first is kept.
    pub fn new(runs: impl IntoIterator<Item = ExistingRun>) -> Self {
        let mut index = Self::default();
        for run in runs {
            index.insert(run, false);
        }
        index
    }

    /// Existing run matching a candidate.
    #[must_use]
    pub fn lookup(&self, candidate: &Candidate<'_>) -> Option<&ExistingRun> {
        self.by_source_id
            .get(candidate.run_id)
            .or_else(|| self.by_name.get(candidate.name))
    }

    /// Record a run just written to the sink, replacing any entry with the same key.
    pub fn record(&mut self, run: ExistingRun) {
        self.insert(run, true);
    }

    /// Forget a run removed from the sink.
    pub fn remove(&mut self, run: &ExistingRun) {
        match &run.source_run_id {
            Some(source_run_id) => {
                self.by_source_id.remove(source_run_id);
            }
            None => {
                self.by_name.remove(&run.name);
            }
        }
    }

    /// Number of indexed runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_source_id.len() + self.by_name.len()
    }

    /// Whether nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, run: ExistingRun, replace: bool) {
        let (map, key) = match &run.source_run_id {
            Some(source_run_id) => (&mut self.by_source_id, source_run_id.clone()),
            None => (&mut self.by_name, run.name.clone()),
        };
        if replace || !map.contains_key(&key) {
            map.insert(key, run);
        }
    }
}

/// Why a run is not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The source run writes to the destination itself.
    DualWriting,
    /// A complete copy exists and crash-resume keeps it.
    AlreadyComplete,
    /// A copy exists and skip-existing keeps it, complete or not.
    AlreadyExists,
}

/// What to do with one candidate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write the run.
    Create,
    /// Leave the sink untouched.
    Skip(SkipReason),
    /// Remove the incomplete copy, then write the run.
    Recreate(ExistingRun),
}

/// Decision table for one migration.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    skip_existing: bool,
    resume_from_crash: bool,
    skip_dual_writing: bool,
}

impl Reconciler {
    /// Build the decision table from a configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigConflict` if `skip_existing_runs` and
    /// `resume_from_crash` are both set
    pub fn new(config: &MigrationConfig) -> Result<Self> {
        if config.skip_existing_runs && config.resume_from_crash {
            return Err(Error::ConfigConflict(
                "`resume_from_crash` and `skip_existing_runs` are mutually exclusive, set only one"
                    .to_string(),
            ));
        }
        Ok(Self {
            skip_existing: config.skip_existing_runs,
            resume_from_crash: config.resume_from_crash,
            skip_dual_writing: config.skip_dual_writing_runs,
        })
    }

    /// Decide for a candidate given the matching run at the sink, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::ExistingRun` if the run exists and neither
    /// skip-existing nor crash-resume is enabled
    pub fn decide(&self, candidate: &Candidate<'_>, existing: Option<&ExistingRun>) -> Result<Action> {
        if candidate.dual_writing && self.skip_dual_writing {
            return Ok(Action::Skip(SkipReason::DualWriting));
        }
        let Some(existing) = existing else {
            return Ok(Action::Create);
        };
        if self.skip_existing {
            return Ok(Action::Skip(SkipReason::AlreadyExists));
        }
        if self.resume_from_crash {
            return Ok(if existing.complete {
                Action::Skip(SkipReason::AlreadyComplete)
            } else {
                Action::Recreate(existing.clone())
            });
        }
        Err(Error::ExistingRun {
            run: candidate.name.to_string(),
        })
    }

    /// Look the candidate up in `index` and decide.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::decide`]
    pub fn plan(&self, candidate: &Candidate<'_>, index: &DestinationIndex) -> Result<Action> {
        self.decide(candidate, index.lookup(candidate))
    }
}
