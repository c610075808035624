//! Run Descriptor Model
//!
//! Normalized, backend-agnostic representation of the data a migration
//! moves: runs with their params, metrics, tags, status and timing, plus
//! the destination experiment they land in.
//!
//! ## Schema Overview
//!
//! ```text
//! ExperimentRecord (1) ──< RunDescriptor (N)
//!                              │
//!                              ├── params   {key → ParamValue}
//!                              ├── metrics  {name → [MetricPoint]} [logging order]
//!                              ├── system   {name → [MetricPoint]}
//!                              └── tags     {key → value}
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_migrate::experiment::{MetricFilter, MetricPoint, RunDescriptor, RunStatus};
//!
//! let filter = MetricFilter::new(&["system/*"])?;
//! let run = RunDescriptor::builder()
//!     .run_id("3f9a2c")
//!     .name("baseline")
//!     .param("lr", 0.1)
//!     .metric("loss", [MetricPoint::new(0, 1.0, 1_000), MetricPoint::new(1, 0.5, 2_000)])
//!     .status(RunStatus::Finished)
//!     .build(&filter)?;
//!
//! assert_eq!(run.metric_point_count(), 2);
//! # Ok::<(), trueno_migrate::Error>(())
//! ```

mod experiment_record;
mod filter;
mod metric_record;
mod param_value;
mod run_descriptor;
pub mod tags;

pub use experiment_record::{ExperimentRecord, ExperimentRecordBuilder};
pub use filter::{MetricFilter, RunSelector};
pub use metric_record::{first_out_of_order, MetricPoint};
pub use param_value::ParamValue;
pub use run_descriptor::{Completion, RunDescriptor, RunDescriptorBuilder, RunStatus};
