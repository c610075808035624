//! Conversions from source-shaped data into Run Descriptor parts.
//!
//! Sources report configs as JSON objects and metric history as rows of
//! `column → value`. These functions normalise both into params and
//! ordered metric series; they do not apply metric exclusion, which
//! happens once when the descriptor is built.

mod metrics;
mod params;
mod system_metrics;

pub use metrics::{history_to_metrics, HistoryRow, RESERVED_HISTORY_KEYS};
pub use params::{
    config_to_params, is_dual_writing, DUAL_WRITE_EXPERIMENT_KEY, DUAL_WRITE_LOGGER, LOGGERS_KEY,
};
pub use system_metrics::system_history_to_metrics;
