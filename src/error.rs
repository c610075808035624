//! Error types for Trueno-Migrate
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Trueno-Migrate error types
#[derive(Error, Debug)]
pub enum Error {
    /// Run is missing identity fields or carries an unusable metric name
    #[error("Malformed run: {0}\nThe run is skipped, the rest of the project continues")]
    MalformedRun(String),

    /// Source API failed while fetching one run
    #[error("Failed to fetch run {run}: {reason}\nThe run is skipped, re-run the migration to retry it")]
    Fetch {
        /// Source run name or id
        run: String,
        /// Underlying failure
        reason: String,
    },

    /// Mutually exclusive flags were set together
    #[error("Conflicting configuration: {0}")]
    ConfigConflict(String),

    /// Configuration rejected before any I/O
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Destination write failed after the run was created
    #[error("Partial write for run {run}: {reason}\nThe run is left incomplete, re-run with `resume_from_crash=true` to recreate it")]
    PartialWrite {
        /// Source run name
        run: String,
        /// Underlying failure
        reason: String,
    },

    /// Staging directory for a run is incomplete or unreadable
    #[error("Staging directory {path} is incomplete: {reason}\nThe run will be exported again")]
    StagingCorruption {
        /// Offending run directory
        path: PathBuf,
        /// What is missing or broken
        reason: String,
    },

    /// Run already exists at the destination and no reconciliation mode was chosen
    #[error("Run {run} already exists at the destination\nSet `skip_existing_runs=true` or `resume_from_crash=true` to migrate into a non-empty experiment")]
    ExistingRun {
        /// Source run name
        run: String,
    },

    /// Source project does not exist
    #[error("Source project not found: {0}")]
    ProjectNotFound(String),

    /// Destination experiment required by the chosen mode does not exist,
    /// or exists without a migration marker
    #[error("Destination experiment not found: {0}\nSet `resume_from_crash=false` to start a fresh migration")]
    ExperimentNotFound(String),

    /// Opaque failure reported by a tracking backend client
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid run selector or metric exclusion pattern
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Fetch result queue closed before every run was delivered
    #[error("Fetch result queue closed (coordinator dropped)")]
    QueueClosed,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error concerns a single run only.
    ///
    /// Run-level errors are counted and reported in the migration summary
    /// and never abort the project.
    #[must_use]
    pub const fn is_run_level(&self) -> bool {
        matches!(
            self,
            Self::MalformedRun(_)
                | Self::Fetch { .. }
                | Self::PartialWrite { .. }
                | Self::StagingCorruption { .. }
                | Self::ExistingRun { .. }
        )
    }
}
