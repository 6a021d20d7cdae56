use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning of the channels and reporting inside a stage graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Buffers a discovered stream may hold before the demuxer waits.
    pub pad_capacity: usize,
    /// Commands queued towards the mux worker.
    pub mux_queue_capacity: usize,
    /// Minimum time between progress reports, 0 reports every change.
    pub progress_interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pad_capacity: 64,
            mux_queue_capacity: 128,
            progress_interval_ms: 5000,
        }
    }
}

impl BusConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
