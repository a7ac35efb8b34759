//! # `StringHub` Core
//!
//! The merge and time-calibration core of a detector-readout string hub.
//!
//! A string hub aggregates streams from many optical modules attached over
//! serial links. Each module independently emits four kinds of timestamped
//! buffers (physics hits, monitoring, supernova scalers, and time-calibration
//! records). This crate provides:
//!
//! - **Merge**: tournament-tree k-way merge of per-channel streams into one
//!   globally time-ordered output stream per data kind, with bounded-queue
//!   backpressure and end-of-stream draining
//! - **Time**: the RAPCal clock-translation pipeline mapping module-local
//!   clock ticks onto detector-wide UTC from TCAL round trips plus a GPS
//!   1PPS source
//! - **Tcal**: the state-driven time-calibration processor that feeds RAPCal
//!   and optionally dispatches formatted calibration records downstream
//! - **Hub**: per-kind fan-in of producer channels into the sort engines,
//!   run-level routing, and lifecycle coordination
//!
//! ## Design Principles
//!
//! 1. **One worker thread per sort engine** - the downstream consumer runs
//!    on that thread; producers only ever block on the bounded input queue
//! 2. **Readiness before emission** - the merge yields an element only once
//!    every registered channel has buffered input, so per-channel ordering
//!    alone guarantees global ordering
//! 3. **No locks on the UTC hot path** - clock translation reads an
//!    atomically swapped affine-map snapshot
//! 4. **Bad calibration samples never kill the pipeline** - RAPCal errors
//!    are logged and suppressed; the mapping continues from the prior window
//!
//! ## Example
//!
//! ```rust,ignore
//! use stringhub_core::hub::{HubConfig, HubConsumers, HubDispatch, RunLevel};
//!
//! let config = HubConfig::default();
//! let mut hub = HubDispatch::new(&config, consumers, gps, hub_mbid)?;
//! hub.configure(&channel_ids)?;
//! hub.start_run()?;
//! // ... producers feed hub.engine(kind).consume(buf) ...
//! hub.stop()?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Allow unsafe in the merge queue for the lock-free ring storage
#![allow(unsafe_code)]

pub mod buffer;
pub mod hub;
pub mod merge;
pub mod tcal;
pub mod time;

// Re-export key types
pub use hub::{HubConfig, HubDispatch, RunLevel, StreamKind};
pub use merge::{BufferConsumer, ChannelSortEngine};

/// Result type for stringhub-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for stringhub-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Raw buffer projection errors
    #[error("Buffer error: {0}")]
    Buffer(#[from] buffer::BufferError),

    /// Merge engine errors
    #[error("Merge error: {0}")]
    Merge(#[from] merge::MergeError),

    /// Downstream consumer errors
    #[error("Consumer error: {0}")]
    Consumer(#[from] merge::ConsumerError),

    /// RAPCal clock-translation errors
    #[error("RAPCal error: {0}")]
    RapCal(#[from] time::RapCalError),

    /// Time-calibration processor errors
    #[error("TCAL error: {0}")]
    Tcal(#[from] tcal::TcalError),

    /// Hub dispatch errors
    #[error("Hub error: {0}")]
    Hub(#[from] hub::HubError),
}
