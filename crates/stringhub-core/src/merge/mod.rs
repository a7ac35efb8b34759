//! # Multi-Channel Merge
//!
//! Time-ordered k-way merge of per-module buffer streams.
//!
//! ## Overview
//!
//! Every optical module is a producer channel emitting raw buffers whose
//! timestamps are monotone nondecreasing. A [`ChannelSortEngine`] fans N
//! such channels into a single consumer, emitting a globally time-ordered
//! stream with deterministic `(timestamp, mbid)` tie-breaking.
//!
//! ## Architecture
//!
//! ```text
//! producer ──┐
//! producer ──┼──▶ MergeQueue ──▶ worker ──▶ TournamentTree ──▶ consumer
//! producer ──┘    (bounded,       thread     (loser tree,
//!                 backpressure)              readiness-gated)
//! ```
//!
//! The engine emits an element only after every registered channel has at
//! least one buffered value, so a single slow channel stalls output. That
//! is intentional: global time ordering cannot be guaranteed otherwise.
//! Operators mitigate stalls through queue backpressure, never by skipping
//! a channel.
//!
//! ## Shutdown
//!
//! Shutdown has no cancel operation: every producer enqueues its
//! end-of-stream sentinel, the sentinels merge to the back of the stream,
//! and the worker terminates after forwarding one downstream end-of-stream
//! notification.
//!
//! ## Module Structure
//!
//! - [`queue`]: bounded metered MPSC queue (the backpressure point)
//! - [`tree`]: arena-backed loser tree
//! - [`engine`]: the sort engine and its worker loop

pub mod engine;
pub mod queue;
pub mod tree;


// Re-export key types
pub use engine::{ChannelSortEngine, SortConfig, SortInput, SortObservables};
pub use queue::{DisabledMeter, MergeQueue, Meter, QueueStats, UtcMeter, DEFAULT_MAX_QUEUE};
pub use tree::TournamentTree;

/// Consumer of merged buffers, running on the engine's worker thread.
///
/// Implementations must either be non-blocking or internally thread-safe
/// when shared with other threads. Errors returned from `consume` abort
/// the calling sort worker.
pub trait BufferConsumer: Send {
    /// Accepts ownership of one merged buffer.
    ///
    /// # Errors
    ///
    /// Any error is treated as fatal by the calling sort worker.
    fn consume(&mut self, buf: bytes::Bytes) -> Result<(), ConsumerError>;

    /// Signals that the stream that fed this consumer has ended.
    ///
    /// `mbid` identifies the channel whose sentinel closed the merge.
    ///
    /// # Errors
    ///
    /// Any error is logged by the calling sort worker.
    fn end_of_stream(&mut self, mbid: u64) -> Result<(), ConsumerError>;

    /// True if a downstream endpoint is attached and wants data.
    fn has_consumer(&self) -> bool {
        true
    }
}

/// Errors surfaced by downstream consumers.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Failure writing to the downstream endpoint.
    #[error("downstream I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The buffer handed over could not be interpreted.
    #[error("malformed buffer: {0}")]
    Malformed(#[from] crate::buffer::BufferError),

    /// Any other downstream failure.
    #[error("{0}")]
    Failed(String),
}

/// Errors raised by the merge engine.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// `register` was called after the worker started.
    #[error("channel {0:012x} registered after the sort worker started")]
    RegisterAfterStart(u64),

    /// `start` was called twice.
    #[error("sort worker already started")]
    AlreadyStarted,

    /// `start` was called with no registered channels.
    #[error("no channels registered")]
    NoChannels,

    /// The worker thread could not be spawned.
    #[error("failed to spawn sort worker: {0}")]
    SpawnFailed(String),

    /// The input queue was closed.
    #[error("sort queue closed")]
    QueueClosed,

    /// The worker thread panicked.
    #[error("sort worker lost")]
    WorkerLost,
}
