//! Tracing subscriber setup
//!
//! Progress goes to stderr; with a log directory, the same events are
//! also appended (without ANSI colours) to `trueno-migrate.log` there.
//! `RUST_LOG` overrides the level chosen by `verbose`.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{Error, Result};

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "trueno-migrate.log";

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an IO error if the log file cannot be opened, or
/// `Error::Other` if a global subscriber is already installed
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE_NAME))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to initialise logging: {e}")))
}
