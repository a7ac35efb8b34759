//! Run-configuration options consumed by the hub dispatch layer.
//!
//! The hub's run configuration arrives from an external loader; the struct
//! deserializes the subset of options the core and its immediate
//! collaborators consume. Unknown channels of configuration (per-module
//! settings, simulation geometry) pass through untouched.

use std::path::PathBuf;

use serde::Deserialize;

use crate::merge::DEFAULT_MAX_QUEUE;

/// Default secondary-stream prescale: one calibration record in ten.
pub const DEFAULT_TCAL_PRESCALE: u32 = 10;

/// Default hit-spool rotation interval, 0.1-ns units (10 seconds).
pub const DEFAULT_HIT_SPOOL_INTERVAL: u64 = 100_000_000_000;

/// Default number of hit-spool files kept on disk.
pub const DEFAULT_HIT_SPOOL_NUM_FILES: u32 = 100;

/// Hub-level run configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubConfig {
    /// Passed through to the per-module collectors.
    pub enable_intervals: bool,

    /// Forward one in N formatted calibration records downstream.
    pub tcal_prescale: u32,

    /// Spool hits to local disk before forwarding.
    pub hit_spooling: bool,

    /// Directory receiving spooled hits.
    pub hit_spool_dir: PathBuf,

    /// Spool-file rotation interval in 0.1-ns units.
    pub hit_spool_interval: u64,

    /// Number of spool files retained.
    pub hit_spool_num_files: u32,

    /// Supernova distance override; simulation only.
    pub sn_distance: Option<f64>,

    /// Select the alternate priority-based merge implementation.
    /// Accepted and recorded; this core always runs the tournament merge.
    pub use_priority_sort: bool,

    /// Bound on each sort engine's input queue.
    pub max_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            enable_intervals: false,
            tcal_prescale: DEFAULT_TCAL_PRESCALE,
            hit_spooling: false,
            hit_spool_dir: PathBuf::from("/mnt/data/pdaqlocal"),
            hit_spool_interval: DEFAULT_HIT_SPOOL_INTERVAL,
            hit_spool_num_files: DEFAULT_HIT_SPOOL_NUM_FILES,
            sn_distance: None,
            use_priority_sort: false,
            max_queue: DEFAULT_MAX_QUEUE,
        }
    }
}

impl HubConfig {
    /// Prescale with the degenerate zero mapped to "every record".
    #[must_use]
    pub fn effective_tcal_prescale(&self) -> u32 {
        self.tcal_prescale.max(1)
    }
}
