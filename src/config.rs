//! Migration configuration
//!
//! One structure carries every option the command surface accepts. It can
//! be built in code or loaded from TOML:
//!
//! ```toml
//! project_name = "demo"
//! resume_from_crash = true
//! exclude_metrics = ["gradients/*"]
//! dry_run_thread_pool_size = 4
//! ```
//!
//! [`MigrationConfig::validate`] is the pre-flight check. It performs no
//! I/O, so a conflicting configuration fails before either backend is
//! touched.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest accepted fetch worker pool.
pub const MAX_THREAD_POOL_SIZE: usize = 256;

/// Which pipeline a configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    /// Source backend → destination backend.
    Live,
    /// Source backend → local staging store.
    DryRunExport,
    /// Local staging store → destination backend.
    ResumeFromDryRun,
}

/// Options for one project migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// Source project to migrate
    pub project_name: String,
    /// Destination experiment name (defaults to the project name)
    pub experiment_name: Option<String>,
    /// Debug-level logging
    pub verbose: bool,
    /// Represent source groups as nested parent runs
    pub use_nested_run: bool,
    /// Export to the staging store instead of the destination
    pub dry_run: bool,
    /// Import previously staged runs into the destination
    pub resume_from_dry_run: bool,
    /// Delete and recreate incomplete destination runs, skip complete ones
    pub resume_from_crash: bool,
    /// Skip runs already present at the destination
    pub skip_existing_runs: bool,
    /// Skip source runs that already write to the destination themselves
    pub skip_dual_writing_runs: bool,
    /// Write into this existing destination experiment
    pub dual_writing_experiment_id: Option<String>,
    /// Run name allow-list; each entry is a regex matched at the start of the name
    pub run_names: Vec<String>,
    /// Glob patterns of metric names to drop
    pub exclude_metrics: Vec<String>,
    /// Fetch worker pool size (1 fetches sequentially)
    pub dry_run_thread_pool_size: usize,
    /// Staging store root; must already exist
    pub dry_run_save_dir: PathBuf,
    /// On import, order runs by their live source creation time
    pub ordered_by_creation_time: bool,
    /// Directory for a persistent log file
    pub log_dir: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            experiment_name: None,
            verbose: false,
            use_nested_run: false,
            dry_run: false,
            resume_from_dry_run: false,
            resume_from_crash: false,
            skip_existing_runs: false,
            skip_dual_writing_runs: false,
            dual_writing_experiment_id: None,
            run_names: Vec::new(),
            exclude_metrics: Vec::new(),
            dry_run_thread_pool_size: 1,
            dry_run_save_dir: PathBuf::from("."),
            ordered_by_creation_time: false,
            log_dir: None,
        }
    }
}

impl MigrationConfig {
    /// Default configuration for one project.
    #[must_use]
    pub fn for_project(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigParse` for malformed TOML or unknown keys
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Pre-flight check. Performs no I/O.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigConflict` for mutually exclusive flags and
    /// `Error::InvalidConfig` for other unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.resume_from_crash && self.skip_existing_runs {
            return Err(Error::ConfigConflict(
                "`resume_from_crash` and `skip_existing_runs` are mutually exclusive, set only one"
                    .to_string(),
            ));
        }
        if self.dry_run && self.resume_from_dry_run {
            return Err(Error::ConfigConflict(
                "`dry_run` exports and `resume_from_dry_run` imports, set only one".to_string(),
            ));
        }
        if self.project_name.trim().is_empty() {
            return Err(Error::InvalidConfig("`project_name` is required".to_string()));
        }
        if !(1..=MAX_THREAD_POOL_SIZE).contains(&self.dry_run_thread_pool_size) {
            return Err(Error::InvalidConfig(format!(
                "`dry_run_thread_pool_size` must be between 1 and {MAX_THREAD_POOL_SIZE}"
            )));
        }
        if self.ordered_by_creation_time && !self.resume_from_dry_run {
            return Err(Error::InvalidConfig(
                "`ordered_by_creation_time` only applies with `resume_from_dry_run`".to_string(),
            ));
        }
        if self.dry_run && self.dual_writing_experiment_id.is_some() {
            return Err(Error::InvalidConfig(
                "`dual_writing_experiment_id` cannot be used with `dry_run`".to_string(),
            ));
        }
        if matches!(&self.experiment_name, Some(name) if name.trim().is_empty()) {
            return Err(Error::InvalidConfig("`experiment_name` is empty".to_string()));
        }
        Ok(())
    }

    /// Pipeline selected by the mode flags.
    #[must_use]
    pub const fn mode(&self) -> MigrationMode {
        if self.dry_run {
            MigrationMode::DryRunExport
        } else if self.resume_from_dry_run {
            MigrationMode::ResumeFromDryRun
        } else {
            MigrationMode::Live
        }
    }

    /// Destination experiment name: the override, else the project name.
    #[must_use]
    pub fn experiment_name(&self) -> &str {
        self.experiment_name.as_deref().unwrap_or(&self.project_name)
    }
}
