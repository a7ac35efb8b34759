//! # Stream Dispatch
//!
//! Per-kind fan-in of producer channels into the sort engines, plus
//! run-level routing and lifecycle coordination.
//!
//! A hub owns one [`ChannelSortEngine`] per stream kind. Physics hits go
//! to the sender consumer, monitoring and supernova scalers to their
//! secondary consumers, and time calibrations to the [`TcalProcessor`],
//! whose formatted records continue (prescaled) to the calibration
//! secondary consumer. The engines run in parallel; there is no ordering
//! guarantee across kinds.
//!
//! ## Lifecycle
//!
//! ```text
//! configure(channels)   register every channel on every engine
//! start_run()           spawn the four sort workers, run level RUNNING
//! ...                   producers feed consume() per kind
//! stop()                enqueue EOS per channel per engine, join workers
//! ```

pub mod config;

pub use config::HubConfig;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::merge::{BufferConsumer, ChannelSortEngine, ConsumerError, MergeError, SortConfig};
use crate::tcal::{TcalHandle, TcalProcessor};
use crate::time::{GpsProvider, RapCal, UtcTranslator};

/// Externally signalled run level. Only [`RunLevel::Running`] is
/// distinguished by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunLevel {
    /// No run configured.
    Idle,
    /// Run configuration being applied.
    Configuring,
    /// Configuration applied; not started.
    Configured,
    /// Workers starting up.
    Starting,
    /// Data taking in progress.
    Running,
    /// Stop requested; streams draining.
    Stopping,
    /// Run ended.
    Stopped,
    /// Component unresponsive.
    Zombie,
}

impl RunLevel {
    /// True exactly for [`RunLevel::Running`].
    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

/// Stream kinds a hub merges independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Physics hits.
    Hit,
    /// Monitoring records.
    Moni,
    /// Supernova scalers.
    Sn,
    /// Time-calibration records.
    Tcal,
}

impl StreamKind {
    /// All kinds, in engine order.
    pub const ALL: [Self; 4] = [Self::Hit, Self::Moni, Self::Sn, Self::Tcal];

    /// Short label used for worker-thread names and logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Moni => "moni",
            Self::Sn => "sn",
            Self::Tcal => "tcal",
        }
    }
}

/// Errors raised by the dispatch layer.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A lifecycle operation arrived before `configure`.
    #[error("hub has no configured channels")]
    NotConfigured,

    /// An engine rejected the operation.
    #[error("{kind} engine: {source}")]
    Engine {
        /// Stream kind whose engine failed.
        kind: &'static str,
        /// Underlying engine error.
        #[source]
        source: MergeError,
    },
}

/// Downstream consumers for the four stream kinds.
///
/// The `tcal` consumer receives formatted calibration records, already
/// prescaled; the other three receive merged raw buffers.
pub struct HubConsumers {
    /// Sender consumer for physics hits.
    pub hit: Box<dyn BufferConsumer + Send>,
    /// Secondary consumer for monitoring records.
    pub moni: Box<dyn BufferConsumer + Send>,
    /// Secondary consumer for supernova scalers.
    pub sn: Box<dyn BufferConsumer + Send>,
    /// Secondary consumer for formatted time-calibration records.
    pub tcal: Box<dyn BufferConsumer + Send>,
}

/// Consumer decorator forwarding one buffer in N.
///
/// End-of-stream always propagates, whatever the prescale phase.
pub struct PrescaledConsumer {
    inner: Box<dyn BufferConsumer + Send>,
    prescale: u64,
    seen: u64,
}

impl PrescaledConsumer {
    /// Wraps a consumer with the given prescale (0 behaves as 1).
    #[must_use]
    pub fn new(inner: Box<dyn BufferConsumer + Send>, prescale: u32) -> Self {
        Self {
            inner,
            prescale: u64::from(prescale.max(1)),
            seen: 0,
        }
    }
}

impl BufferConsumer for PrescaledConsumer {
    fn consume(&mut self, buf: Bytes) -> Result<(), ConsumerError> {
        let forward = self.seen % self.prescale == 0;
        self.seen += 1;
        if forward {
            self.inner.consume(buf)
        } else {
            Ok(())
        }
    }

    fn end_of_stream(&mut self, mbid: u64) -> Result<(), ConsumerError> {
        self.inner.end_of_stream(mbid)
    }

    fn has_consumer(&self) -> bool {
        self.inner.has_consumer()
    }
}

impl std::fmt::Debug for PrescaledConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrescaledConsumer")
            .field("prescale", &self.prescale)
            .field("seen", &self.seen)
            .finish()
    }
}

/// Owns the four per-kind sort engines and their shared calibration state.
pub struct HubDispatch {
    hit: ChannelSortEngine,
    moni: ChannelSortEngine,
    sn: ChannelSortEngine,
    tcal: ChannelSortEngine,
    tcal_handle: TcalHandle,
    channels: Vec<u64>,
    run_level: RunLevel,
}

impl HubDispatch {
    /// Wires the engines to their consumers.
    ///
    /// `hub_mbid` identifies the hub itself on the secondary calibration
    /// stream. The GPS provider is passed in explicitly so simulation and
    /// tests can substitute their own source.
    #[must_use]
    pub fn new(
        config: &HubConfig,
        consumers: HubConsumers,
        gps: Arc<dyn GpsProvider>,
        hub_mbid: u64,
    ) -> Self {
        let prescaled = PrescaledConsumer::new(consumers.tcal, config.effective_tcal_prescale());
        let processor = TcalProcessor::new(hub_mbid, RapCal::new(), gps, Box::new(prescaled));
        let tcal_handle = processor.handle();

        let engine = |label: &'static str, consumer: Box<dyn BufferConsumer + Send>| {
            ChannelSortEngine::with_config(
                label,
                consumer,
                SortConfig {
                    max_queue: config.max_queue,
                    ..SortConfig::default()
                },
            )
        };

        Self {
            hit: engine(StreamKind::Hit.label(), consumers.hit),
            moni: engine(StreamKind::Moni.label(), consumers.moni),
            sn: engine(StreamKind::Sn.label(), consumers.sn),
            tcal: engine(StreamKind::Tcal.label(), Box::new(processor)),
            tcal_handle,
            channels: Vec::new(),
            run_level: RunLevel::Idle,
        }
    }

    /// Registers every channel on every engine. Call once, before
    /// [`HubDispatch::start_run`].
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Engine`] if any engine already started.
    pub fn configure(&mut self, channels: &[u64]) -> Result<(), HubError> {
        self.set_run_level(RunLevel::Configuring);
        for &mbid in channels {
            for (kind, engine) in self.engines_mut() {
                engine
                    .register(mbid)
                    .map_err(|source| HubError::Engine { kind, source })?;
            }
        }
        self.channels = channels.to_vec();
        self.set_run_level(RunLevel::Configured);
        info!(channels = channels.len(), "hub configured");
        Ok(())
    }

    /// Starts the four sort workers and raises the run level to RUNNING.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotConfigured`] before `configure`, or
    /// [`HubError::Engine`] on a second start.
    pub fn start_run(&mut self) -> Result<(), HubError> {
        if self.channels.is_empty() {
            return Err(HubError::NotConfigured);
        }
        self.set_run_level(RunLevel::Starting);
        for (kind, engine) in self.engines_mut() {
            engine
                .start()
                .map_err(|source| HubError::Engine { kind, source })?;
        }
        self.set_run_level(RunLevel::Running);
        info!("hub run started");
        Ok(())
    }

    /// Forwards a run-level transition to the calibration processor and
    /// records it.
    pub fn set_run_level(&mut self, level: RunLevel) {
        debug!(?level, "hub run level");
        self.run_level = level;
        self.tcal_handle.run_level(level);
    }

    /// Returns the current run level.
    #[must_use]
    pub fn run_level(&self) -> RunLevel {
        self.run_level
    }

    /// Drains and stops the hub: every registered channel receives an
    /// end-of-stream sentinel on every engine, then the workers are
    /// joined.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Engine`] if a sentinel cannot be enqueued or a
    /// worker is lost.
    pub fn stop(&mut self) -> Result<(), HubError> {
        self.set_run_level(RunLevel::Stopping);
        let channels = self.channels.clone();
        for (kind, engine) in self.engines_mut() {
            for &mbid in &channels {
                engine
                    .end_of_stream(mbid)
                    .map_err(|source| HubError::Engine { kind, source })?;
            }
        }
        for (kind, engine) in self.engines_mut() {
            engine
                .join()
                .map_err(|source| HubError::Engine { kind, source })?;
        }
        self.set_run_level(RunLevel::Stopped);
        info!("hub run stopped");
        Ok(())
    }

    /// Returns the engine for a stream kind, for producers to feed.
    #[must_use]
    pub fn engine(&self, kind: StreamKind) -> &ChannelSortEngine {
        match kind {
            StreamKind::Hit => &self.hit,
            StreamKind::Moni => &self.moni,
            StreamKind::Sn => &self.sn,
            StreamKind::Tcal => &self.tcal,
        }
    }

    /// Returns the calibration control handle.
    #[must_use]
    pub fn tcal_handle(&self) -> &TcalHandle {
        &self.tcal_handle
    }

    /// Returns the UTC translator shared with downstream consumers.
    #[must_use]
    pub fn translator(&self) -> UtcTranslator {
        self.tcal_handle.translator()
    }

    fn engines_mut(&mut self) -> [(&'static str, &mut ChannelSortEngine); 4] {
        [
            (StreamKind::Hit.label(), &mut self.hit),
            (StreamKind::Moni.label(), &mut self.moni),
            (StreamKind::Sn.label(), &mut self.sn),
            (StreamKind::Tcal.label(), &mut self.tcal),
        ]
    }
}

impl std::fmt::Debug for HubDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubDispatch")
            .field("channels", &self.channels.len())
            .field("run_level", &self.run_level)
            .finish()
    }
}
