//! Staging store sink for dry-run export.

use std::collections::BTreeMap;

use tracing::info;

use super::RunSink;
use crate::config::MigrationConfig;
use crate::experiment::tags::{MIGRATED_FROM_PROJECT_TAG, SOURCE_PROJECT_NAME_TAG, TRUE_VALUE};
use crate::experiment::RunDescriptor;
use crate::reconcile::ExistingRun;
use crate::staging::StagingStore;
use crate::Result;

/// Writes runs into one project directory of a staging store.
#[derive(Debug)]
pub struct StagingWriter<'a> {
    store: &'a StagingStore,
    project: String,
}

impl<'a> StagingWriter<'a> {
    /// Prepare the project directory and record its tags.
    ///
    /// With `resume_from_crash`, incomplete run directories left by an
    /// interrupted export are removed first.
    ///
    /// # Errors
    ///
    /// Returns error if the project directory cannot be prepared
    pub fn open(store: &'a StagingStore, config: &MigrationConfig) -> Result<Self> {
        let project = config.project_name.clone();
        let tags = BTreeMap::from([
            (MIGRATED_FROM_PROJECT_TAG.to_string(), TRUE_VALUE.to_string()),
            (SOURCE_PROJECT_NAME_TAG.to_string(), project.clone()),
        ]);
        store.init_project(&project, &tags)?;
        if config.resume_from_crash {
            let pruned = store.prune_incomplete(&project)?;
            if pruned > 0 {
                info!(project = %project, pruned, "removed incomplete staged runs");
            }
        }
        Ok(Self { store, project })
    }
}

impl RunSink for StagingWriter<'_> {
    fn existing_runs(&mut self) -> Result<Vec<ExistingRun>> {
        Ok(self
            .store
            .exported_run_ids(&self.project)?
            .into_iter()
            .map(|run_id| ExistingRun {
                name: run_id.clone(),
                source_run_id: Some(run_id.clone()),
                run_id,
                complete: true,
                created_at: None,
            })
            .collect())
    }

    fn remove(&mut self, run: &ExistingRun) -> Result<()> {
        self.store.remove(&self.project, &run.run_id)
    }

    fn write(&mut self, run: &RunDescriptor) -> Result<ExistingRun> {
        let dir = self.store.write(&self.project, run)?;
        info!(run = %run.name(), path = %dir.display(), "staged run");
        Ok(ExistingRun {
            run_id: run.run_id().to_string(),
            name: run.name().to_string(),
            source_run_id: Some(run.run_id().to_string()),
            complete: true,
            created_at: None,
        })
    }

    fn describe(&self) -> String {
        self.store.project_dir(&self.project).display().to_string()
    }
}
