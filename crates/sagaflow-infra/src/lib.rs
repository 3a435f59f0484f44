//! Infrastructure layer for Sagaflow.
//!
//! Contains implementations of the ports defined in `sagaflow-core`:
//! the TOML engine configuration loader and the filesystem snapshot store.

pub mod config;
pub mod snapshot;

use std::path::PathBuf;

/// Resolve the Sagaflow data directory.
///
/// Priority:
/// 1. `SAGAFLOW_DATA_DIR` environment variable
/// 2. `~/.sagaflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SAGAFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".sagaflow");
    }

    // Last resort: current directory
    PathBuf::from(".sagaflow")
}
