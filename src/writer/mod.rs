//! Writer - materialize Run Descriptors at a sink
//!
//! A sink is where runs end up: the destination backend
//! ([`DestinationWriter`]) or the local staging store during a dry-run
//! export ([`StagingWriter`]). The migration pipeline drives both
//! through [`RunSink`], one run at a time, from a single thread.

mod destination;
mod staging;

pub use destination::{
    resolve_experiment, DestinationWriter, MAX_METRICS_PER_BATCH, MAX_PARAMS_PER_BATCH,
};
pub use staging::StagingWriter;

use crate::experiment::RunDescriptor;
use crate::reconcile::ExistingRun;
use crate::Result;

/// Target of a migration.
pub trait RunSink {
    /// Runs already present, for reconciliation.
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot be listed
    fn existing_runs(&mut self) -> Result<Vec<ExistingRun>>;

    /// Remove an incomplete run before it is written again.
    ///
    /// # Errors
    ///
    /// Returns error if the run cannot be removed
    fn remove(&mut self, run: &ExistingRun) -> Result<()>;

    /// Write one run completely, marking it complete last.
    ///
    /// # Errors
    ///
    /// Returns error if any part fails; the run is then left incomplete
    fn write(&mut self, run: &RunDescriptor) -> Result<ExistingRun>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}
