//! # Trueno-Migrate: Resumable Experiment-Tracking Migration
//!
//! **Version**: 0.1.0
//!
//! Trueno-Migrate moves experiment-tracking data (projects, runs, params,
//! metrics, tags) from one tracking backend to another. Migrations resume
//! after a crash without duplicating runs, and large projects can be
//! staged to disk first and imported later.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: A run is marked complete only after everything was
//!   written, so an interrupted migration is detectable and repairable
//! - **Poka-Yoke safety**: Conflicting modes are rejected before any I/O
//! - **Muda elimination**: Skipped runs are never fetched; params and
//!   metrics are written in batches
//! - **Heijunka**: A bounded worker pool levels metric-history retrieval
//!   while a single coordinator keeps destination writes in order
//!
//! ## Pipeline
//!
//! ```text
//! SourceClient ──> Fetcher ──┐
//!                            ├──> Reconciler ──> DestinationWriter ──> DestinationClient
//! StagingStore ──> reader ───┘               └─> StagingWriter ──────> StagingStore
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use trueno_migrate::backend::{MemoryDestination, MemorySource, SourceRun};
//! use trueno_migrate::config::MigrationConfig;
//! use trueno_migrate::migrate::Migrator;
//!
//! let source = MemorySource::new();
//! source.add_run("demo", SourceRun::new("r1", "baseline"), vec![], vec![]);
//! let destination = MemoryDestination::new();
//!
//! let config = MigrationConfig {
//!     skip_existing_runs: true,
//!     ..MigrationConfig::for_project("demo")
//! };
//! let summary = Migrator::new(config, &source)?
//!     .with_destination(&destination)
//!     .run()?;
//!
//! assert_eq!(summary.created, 1);
//! # Ok::<(), trueno_migrate::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod backend;
pub mod config;
pub mod convert;
pub mod error;
pub mod experiment;
pub mod fetch;
pub mod logging;
pub mod migrate;
pub mod reconcile;
pub mod staging;
pub mod writer;

pub use config::{MigrationConfig, MigrationMode};
pub use error::{Error, Result};
pub use migrate::{MigrationSummary, Migrator};
