//! Experiment Record - destination-side container of migrated runs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::tags::MIGRATED_FROM_PROJECT_TAG;

/// Experiment Record represents a destination experiment.
///
/// Each source project maps to exactly one experiment per migration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentRecord {
    experiment_id: String,
    name: String,
    tags: BTreeMap<String, String>,
}

impl ExperimentRecord {
    /// Create a new experiment record with the given ID and name.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Create a builder for constructing an experiment record with tags.
    #[must_use]
    pub fn builder(
        experiment_id: impl Into<String>,
        name: impl Into<String>,
    ) -> ExperimentRecordBuilder {
        ExperimentRecordBuilder::new(experiment_id, name)
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the experiment tags.
    #[must_use]
    pub const fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Whether a previous migration created or adopted this experiment.
    #[must_use]
    pub fn is_migration_target(&self) -> bool {
        self.tags.contains_key(MIGRATED_FROM_PROJECT_TAG)
    }

    /// Merge tags into the record, overwriting existing keys.
    pub fn merge_tags(&mut self, tags: &BTreeMap<String, String>) {
        self.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Builder for `ExperimentRecord`.
#[derive(Debug)]
pub struct ExperimentRecordBuilder {
    experiment_id: String,
    name: String,
    tags: BTreeMap<String, String>,
}

impl ExperimentRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(experiment_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add an experiment tag.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Build the `ExperimentRecord`.
    #[must_use]
    pub fn build(self) -> ExperimentRecord {
        ExperimentRecord {
            experiment_id: self.experiment_id,
            name: self.name,
            tags: self.tags,
        }
    }
}
