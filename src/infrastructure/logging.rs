use crate::infrastructure::error::InfraError;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "sync.log";

/// Installs a JSON-lines subscriber writing to `logs_dir/sync.log`.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init_logging(logs_dir: &Path) -> Result<(), InfraError> {
    fs::create_dir_all(logs_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(LOG_FILE))?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_current_span(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|error| InfraError::Logging(error.to_string()))
}
