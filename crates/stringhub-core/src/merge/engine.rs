//! Channel sort engine: N producers, one time-ordered consumer.
//!
//! Producers enqueue raw buffers through [`ChannelSortEngine::consume`];
//! a dedicated worker thread projects them, feeds the tournament tree, and
//! forwards the globally minimum buffer to the downstream consumer whenever
//! every registered channel has input buffered. The downstream consumer
//! runs on the worker thread.
//!
//! Channels must all be registered before `start`; the worker terminates
//! when the end-of-stream sentinel has been merged for every channel, or
//! aborts on a malformed buffer or consumer failure.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use fxhash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::buffer::{eos, DaqBuffer, EOS_TIMESTAMP};

use super::queue::{DisabledMeter, MergeQueue, Meter, QueueStats, UtcMeter, DEFAULT_MAX_QUEUE};
use super::tree::TournamentTree;
use super::{BufferConsumer, MergeError};

/// Configuration for a sort engine.
pub struct SortConfig {
    /// Bound on the input queue; producers block beyond it.
    pub max_queue: usize,
    /// Meter observing the input queue.
    pub queue_meter: Arc<dyn Meter>,
    /// Meter observing the sort stage, in detector time.
    pub sort_meter: Arc<dyn UtcMeter>,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_MAX_QUEUE,
            queue_meter: Arc::new(DisabledMeter),
            sort_meter: Arc::new(DisabledMeter),
        }
    }
}

impl std::fmt::Debug for SortConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortConfig")
            .field("max_queue", &self.max_queue)
            .finish_non_exhaustive()
    }
}

/// Shared observables of a running engine.
///
/// Reads are independently consistent only; a snapshot may pair an input
/// counter with a slightly older output timestamp.
#[derive(Debug, Default)]
pub struct SortObservables {
    last_input_ts: AtomicI64,
    last_output_ts: AtomicI64,
    inputs: AtomicU64,
    outputs: AtomicU64,
}

impl SortObservables {
    /// Timestamp of the most recently dequeued input buffer.
    #[must_use]
    pub fn last_input_time(&self) -> i64 {
        self.last_input_ts.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recently emitted output buffer.
    #[must_use]
    pub fn last_output_time(&self) -> i64 {
        self.last_output_ts.load(Ordering::Relaxed)
    }

    /// Number of accepted non-sentinel input buffers.
    #[must_use]
    pub fn inputs(&self) -> u64 {
        self.inputs.load(Ordering::Relaxed)
    }

    /// Number of non-sentinel buffers forwarded downstream.
    #[must_use]
    pub fn outputs(&self) -> u64 {
        self.outputs.load(Ordering::Relaxed)
    }
}

/// Cloneable producer handle for enqueueing into an engine.
///
/// Collectors hold one of these per stream kind; every call shares the
/// engine's bounded queue and its backpressure.
#[derive(Clone)]
pub struct SortInput {
    queue: Arc<MergeQueue>,
    meter: Arc<dyn Meter>,
}

impl SortInput {
    /// Enqueues a raw buffer, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::QueueClosed`] if the engine shut down.
    pub fn consume(&self, raw: Bytes) -> Result<(), MergeError> {
        self.queue
            .put(raw, self.meter.as_ref())
            .map_err(|_| MergeError::QueueClosed)
    }

    /// Enqueues the end-of-stream sentinel for a channel.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::QueueClosed`] if the engine shut down.
    pub fn end_of_stream(&self, mbid: u64) -> Result<(), MergeError> {
        self.consume(eos(mbid))
    }
}

impl std::fmt::Debug for SortInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortInput")
            .field("queue_depth", &self.queue.len())
            .finish()
    }
}

/// K-way merge of registered producer channels into one consumer.
pub struct ChannelSortEngine {
    label: String,
    queue: Arc<MergeQueue>,
    queue_meter: Arc<dyn Meter>,
    sort_meter: Arc<dyn UtcMeter>,
    channels: FxHashMap<u64, usize>,
    consumer: Option<Box<dyn BufferConsumer + Send>>,
    observables: Arc<SortObservables>,
    worker: Option<JoinHandle<()>>,
}

impl ChannelSortEngine {
    /// Creates an engine with default configuration.
    ///
    /// `label` names the stream kind for thread naming and logs.
    #[must_use]
    pub fn new(label: impl Into<String>, consumer: Box<dyn BufferConsumer + Send>) -> Self {
        Self::with_config(label, consumer, SortConfig::default())
    }

    /// Creates an engine with explicit configuration.
    #[must_use]
    pub fn with_config(
        label: impl Into<String>,
        consumer: Box<dyn BufferConsumer + Send>,
        config: SortConfig,
    ) -> Self {
        Self {
            label: label.into(),
            queue: Arc::new(MergeQueue::new(config.max_queue)),
            queue_meter: config.queue_meter,
            sort_meter: config.sort_meter,
            channels: FxHashMap::default(),
            consumer: Some(consumer),
            observables: Arc::new(SortObservables::default()),
            worker: None,
        }
    }

    /// Returns the engine's stream-kind label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Registers a producer channel. Must precede [`ChannelSortEngine::start`].
    ///
    /// Re-registering an mbid is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::RegisterAfterStart`] once the worker is running.
    pub fn register(&mut self, mbid: u64) -> Result<(), MergeError> {
        if self.worker.is_some() {
            return Err(MergeError::RegisterAfterStart(mbid));
        }
        let next = self.channels.len();
        self.channels.entry(mbid).or_insert(next);
        Ok(())
    }

    /// Returns the number of registered channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Spawns the sort worker.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::AlreadyStarted`] on a second call and
    /// [`MergeError::NoChannels`] if nothing was registered.
    pub fn start(&mut self) -> Result<(), MergeError> {
        if self.worker.is_some() {
            return Err(MergeError::AlreadyStarted);
        }
        if self.channels.is_empty() {
            return Err(MergeError::NoChannels);
        }
        let consumer = self.consumer.take().ok_or(MergeError::AlreadyStarted)?;

        let ctx = WorkerContext {
            label: self.label.clone(),
            queue: Arc::clone(&self.queue),
            queue_meter: Arc::clone(&self.queue_meter),
            sort_meter: Arc::clone(&self.sort_meter),
            channels: self.channels.clone(),
            observables: Arc::clone(&self.observables),
            consumer,
        };

        let handle = thread::Builder::new()
            .name(format!("channel-sort-{}", self.label))
            .spawn(move || sort_worker(ctx))
            .map_err(|e| MergeError::SpawnFailed(e.to_string()))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Enqueues a raw buffer. Thread-safe; blocks while the bounded queue
    /// is full (backpressure). The sentinel is accepted like any element.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::QueueClosed`] if the engine shut down.
    pub fn consume(&self, raw: Bytes) -> Result<(), MergeError> {
        self.queue
            .put(raw, self.queue_meter.as_ref())
            .map_err(|_| MergeError::QueueClosed)
    }

    /// Enqueues the end-of-stream sentinel for a channel.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::QueueClosed`] if the engine shut down.
    pub fn end_of_stream(&self, mbid: u64) -> Result<(), MergeError> {
        self.consume(eos(mbid))
    }

    /// Awaits worker termination.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::WorkerLost`] if the worker panicked.
    pub fn join(&mut self) -> Result<(), MergeError> {
        match self.worker.take() {
            Some(handle) => handle.join().map_err(|_| MergeError::WorkerLost),
            None => Ok(()),
        }
    }

    /// Returns a cloneable producer handle onto this engine's queue.
    #[must_use]
    pub fn input(&self) -> SortInput {
        SortInput {
            queue: Arc::clone(&self.queue),
            meter: Arc::clone(&self.queue_meter),
        }
    }

    /// Returns the shared observables handle.
    #[must_use]
    pub fn observables(&self) -> Arc<SortObservables> {
        Arc::clone(&self.observables)
    }

    /// Returns the current input-queue depth.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Returns input-queue counters.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

impl Drop for ChannelSortEngine {
    fn drop(&mut self) {
        // Unblock a worker still waiting on input; join quietly.
        self.queue.close();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ChannelSortEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSortEngine")
            .field("label", &self.label)
            .field("channels", &self.channels.len())
            .field("started", &self.worker.is_some())
            .finish()
    }
}

struct WorkerContext {
    label: String,
    queue: Arc<MergeQueue>,
    queue_meter: Arc<dyn Meter>,
    sort_meter: Arc<dyn UtcMeter>,
    channels: FxHashMap<u64, usize>,
    observables: Arc<SortObservables>,
    consumer: Box<dyn BufferConsumer + Send>,
}

/// The merge loop. Runs until every channel's sentinel has been merged,
/// the queue closes, or a fatal error aborts the sort.
fn sort_worker(mut ctx: WorkerContext) {
    let mut tree = TournamentTree::new(ctx.channels.len());
    let mut last_output_ts = 0i64;

    while let Some(raw) = ctx.queue.take(ctx.queue_meter.as_ref()) {
        let in_size = raw.len();
        let daq = match DaqBuffer::parse(raw) {
            Ok(daq) => daq,
            Err(e) => {
                error!(sorter = %ctx.label, "aborting sort worker: {e}");
                return;
            }
        };

        ctx.observables
            .last_input_ts
            .store(daq.timestamp(), Ordering::Relaxed);

        let Some(&leaf) = ctx.channels.get(&daq.mbid()) else {
            error!(
                sorter = %ctx.label,
                "dropping buffer from unknown channel {:012x}",
                daq.mbid()
            );
            continue;
        };

        // Sentinels are control flow, not data: they bypass the counters
        // and the sort meter.
        if !daq.is_eos() {
            let inputs = ctx.observables.inputs.fetch_add(1, Ordering::Relaxed) + 1;
            ctx.sort_meter.report_in(in_size, daq.timestamp());
            if inputs % 1000 == 0 {
                debug!(
                    sorter = %ctx.label,
                    inputs,
                    outputs = ctx.observables.outputs.load(Ordering::Relaxed),
                    "sort progress"
                );
            }
        }

        tree.push(leaf, daq);
        while !tree.is_empty() {
            let Some(sorted) = tree.pop() else { break };

            if last_output_ts > sorted.timestamp() {
                // Cannot fire when per-channel inputs are monotone; kept as
                // an anomaly detector, never fatal.
                warn!(
                    sorter = %ctx.label,
                    "out-of-order output from {:012x}: {} after {} (diff {})",
                    sorted.mbid(),
                    sorted.timestamp(),
                    last_output_ts,
                    last_output_ts - sorted.timestamp()
                );
            }
            last_output_ts = sorted.timestamp();
            ctx.observables
                .last_output_ts
                .store(last_output_ts, Ordering::Relaxed);

            if sorted.timestamp() == EOS_TIMESTAMP {
                // The tree yields the sentinel only once every leaf head is
                // a sentinel, i.e. all channels have ended.
                info!(sorter = %ctx.label, "found stop symbol in stream, shutting down");
                if let Err(e) = ctx.consumer.end_of_stream(sorted.mbid()) {
                    error!(sorter = %ctx.label, "end-of-stream delivery failed: {e}");
                }
                return;
            }

            let out_size = sorted.len();
            let out_ts = sorted.timestamp();
            if let Err(e) = ctx.consumer.consume(sorted.into_bytes()) {
                error!(sorter = %ctx.label, "aborting sort worker: consumer failed: {e}");
                return;
            }
            ctx.observables.outputs.fetch_add(1, Ordering::Relaxed);
            ctx.sort_meter.report_out(out_size, out_ts);
        }
    }

    warn!(sorter = %ctx.label, "input queue closed before end-of-stream");
}
