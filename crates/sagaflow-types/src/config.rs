//! Engine configuration types for Sagaflow.
//!
//! `EngineConfig` represents the `sagaflow.toml` that tunes pause polling,
//! statistics history, loop and subflow limits, and event channel sizing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a `FlowEngine`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fallback poll interval while a run is paused.
    #[serde(default = "default_pause_poll_interval_ms")]
    pub pause_poll_interval_ms: u64,

    /// Completed/failed run durations kept for `avg_duration_ms`.
    #[serde(default = "default_duration_history_limit")]
    pub duration_history_limit: usize,

    /// Iteration cap for loop steps that do not set `max_iterations`.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Maximum subflow nesting depth.
    #[serde(default = "default_max_subflow_depth")]
    pub max_subflow_depth: u32,

    /// Capacity of the broadcast channel behind the event bus.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_pause_poll_interval_ms() -> u64 {
    100
}

fn default_duration_history_limit() -> usize {
    1000
}

fn default_max_iterations() -> u32 {
    1000
}

fn default_max_subflow_depth() -> u32 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl EngineConfig {
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pause_poll_interval_ms: default_pause_poll_interval_ms(),
            duration_history_limit: default_duration_history_limit(),
            default_max_iterations: default_max_iterations(),
            max_subflow_depth: default_max_subflow_depth(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}
