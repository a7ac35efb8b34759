//! # TCAL Processor
//!
//! Consumes merged time-calibration buffers, drives [`RapCal`], and
//! optionally dispatches a formatted calibration record downstream.
//!
//! The processor is unusual among stream consumers in three ways:
//!
//! - it updates the RAPCal instance whose translation every other stream
//!   kind reads,
//! - it stays active across all run levels, processing calibrations even
//!   when nothing may be dispatched, and
//! - it must survive the initial calibrations during which RAPCal cannot
//!   yet reconstruct UTC.
//!
//! Two orthogonal mode slots capture this:
//!
//! - [`ProcessingMode`]: `Primordial` until two RAPCal updates succeed,
//!   then `Established` forever (never transitions back)
//! - [`DispatchMode`]: `Running` exactly while the externally signalled
//!   run level is RUNNING, `Null` otherwise
//!
//! The dispatch slot lives in an atomic cell so the [`TcalHandle`] can
//! flip it from the run-control thread while the processor runs on a sort
//! engine's worker.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::buffer::DaqBuffer;
use crate::hub::RunLevel;
use crate::merge::{BufferConsumer, ConsumerError};
use crate::time::{
    GpsInfo, GpsProvider, RapCal, RapCalError, TimeCalib, UtcTranslator, GPS_EPOCH_PLACEHOLDER,
};

/// Format id stamped into dispatched time-calibration records.
pub const MAGIC_TCAL_FMTID: i32 = 202;

/// Sentinel reported while UTC reconstruction is undefined.
pub const UTC_UNDEFINED: i64 = -1;

/// Errors raised while processing a time-calibration buffer.
#[derive(Debug, thiserror::Error)]
pub enum TcalError {
    /// The calibration payload could not be decoded.
    #[error("bad time-calibration record: {0}")]
    Record(#[from] RapCalError),

    /// The downstream consumer rejected the formatted record.
    #[error("tcal dispatch failed: {0}")]
    Consumer(#[from] ConsumerError),
}

/// UTC-reconstruction mode. Transitions Primordial → Established exactly
/// once, after the second successful RAPCal update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Fewer than two accepted calibrations; UTC is undefined.
    Primordial {
        /// Successful RAPCal updates so far.
        valid_updates: u32,
    },
    /// Translation established; stays here for the life of the run.
    Established,
}

/// Record-dispatch mode, driven by the run level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchMode {
    /// Swallow records (any run level other than RUNNING).
    Null = 0,
    /// Format and forward records downstream.
    Running = 1,
}

/// Counters reported by the processor.
#[derive(Debug, Default)]
pub struct TcalStats {
    processed: AtomicU64,
    last_utc: AtomicI64,
    rapcal_errors: AtomicU64,
    gps_missing_dispatches: AtomicU64,
}

impl TcalStats {
    fn record(&self, utc: i64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.last_utc.store(utc, Ordering::Relaxed);
    }

    /// Calibrations processed.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// UTC of the newest calibration, or [`UTC_UNDEFINED`].
    #[must_use]
    pub fn last_utc(&self) -> i64 {
        self.last_utc.load(Ordering::Relaxed)
    }

    /// RAPCal updates that were rejected and suppressed.
    #[must_use]
    pub fn rapcal_errors(&self) -> u64 {
        self.rapcal_errors.load(Ordering::Relaxed)
    }

    /// Records dispatched with the epoch-zero GPS placeholder because no
    /// snapshot was available.
    #[must_use]
    pub fn gps_missing_dispatches(&self) -> u64 {
        self.gps_missing_dispatches.load(Ordering::Relaxed)
    }
}

/// Control handle usable from outside the sort worker.
#[derive(Clone)]
pub struct TcalHandle {
    dispatch: Arc<AtomicU8>,
    stats: Arc<TcalStats>,
    translator: UtcTranslator,
}

impl TcalHandle {
    /// Routes an externally signalled run level to the dispatch slot.
    /// RUNNING selects [`DispatchMode::Running`]; anything else selects
    /// [`DispatchMode::Null`].
    pub fn run_level(&self, level: RunLevel) {
        if level == RunLevel::Running {
            debug!("setting tcal dispatch mode to [running]");
            self.dispatch
                .store(DispatchMode::Running as u8, Ordering::Release);
        } else {
            debug!("setting tcal dispatch mode to [null]");
            self.dispatch
                .store(DispatchMode::Null as u8, Ordering::Release);
        }
    }

    /// Returns the processor's counters.
    #[must_use]
    pub fn stats(&self) -> &TcalStats {
        &self.stats
    }

    /// Returns the UTC translator fed by this processor's RAPCal.
    #[must_use]
    pub fn translator(&self) -> UtcTranslator {
        self.translator.clone()
    }
}

impl std::fmt::Debug for TcalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcalHandle")
            .field("processed", &self.stats.processed())
            .finish()
    }
}

/// The time-calibration stream processor.
pub struct TcalProcessor {
    mbid: u64,
    rapcal: RapCal,
    gps: Arc<dyn GpsProvider>,
    consumer: Box<dyn BufferConsumer + Send>,
    processing: ProcessingMode,
    dispatch: Arc<AtomicU8>,
    stats: Arc<TcalStats>,
}

impl TcalProcessor {
    /// Creates a processor in `Primordial` processing and `Null` dispatch
    /// mode.
    ///
    /// `mbid` identifies this processor on the secondary stream; it keys
    /// the dispatched records and the end-of-stream notification.
    #[must_use]
    pub fn new(
        mbid: u64,
        rapcal: RapCal,
        gps: Arc<dyn GpsProvider>,
        consumer: Box<dyn BufferConsumer + Send>,
    ) -> Self {
        Self {
            mbid,
            rapcal,
            gps,
            consumer,
            processing: ProcessingMode::Primordial { valid_updates: 0 },
            dispatch: Arc::new(AtomicU8::new(DispatchMode::Null as u8)),
            stats: Arc::new(TcalStats::default()),
        }
    }

    /// Returns the external control handle. Grab this before the
    /// processor moves onto the sort worker.
    #[must_use]
    pub fn handle(&self) -> TcalHandle {
        TcalHandle {
            dispatch: Arc::clone(&self.dispatch),
            stats: Arc::clone(&self.stats),
            translator: self.rapcal.translator(),
        }
    }

    /// Returns the current processing mode.
    #[must_use]
    pub fn processing_mode(&self) -> ProcessingMode {
        self.processing
    }

    /// Returns the current dispatch mode.
    #[must_use]
    pub fn dispatch_mode(&self) -> DispatchMode {
        if self.dispatch.load(Ordering::Acquire) == DispatchMode::Running as u8 {
            DispatchMode::Running
        } else {
            DispatchMode::Null
        }
    }

    /// Processes one calibration payload (the bytes after the raw-buffer
    /// header) and returns the reconstructed UTC, or [`UTC_UNDEFINED`]
    /// while RAPCal is primordial.
    ///
    /// The first defined UTC is produced immediately after the
    /// establishing update, from a map that has only just seen its second
    /// sample; downstream consumers treat it as a continuity value rather
    /// than a precision value.
    ///
    /// # Errors
    ///
    /// Returns [`TcalError::Record`] for an undecodable payload and
    /// [`TcalError::Consumer`] when record dispatch fails. RAPCal update
    /// failures are suppressed, never returned.
    pub fn process(&mut self, payload: &[u8]) -> Result<i64, TcalError> {
        let tcal = TimeCalib::parse(payload)?;
        let gps = self.gps.gps_info();

        let utc = match self.processing {
            ProcessingMode::Primordial { valid_updates } => {
                let mut n = valid_updates;
                if let Some(g) = gps.as_ref() {
                    if self.update_rapcal(&tcal, g) {
                        n += 1;
                    }
                }
                if n > 1 {
                    debug!(
                        "setting tcal processing mode for {:012x} to [established]",
                        self.mbid
                    );
                    self.processing = ProcessingMode::Established;
                    self.rapcal
                        .dom_to_utc(tcal.dom_ticks())
                        .unwrap_or(UTC_UNDEFINED)
                } else {
                    self.processing = ProcessingMode::Primordial { valid_updates: n };
                    UTC_UNDEFINED
                }
            }
            ProcessingMode::Established => {
                if let Some(g) = gps.as_ref() {
                    let _ = self.update_rapcal(&tcal, g);
                }
                self.rapcal
                    .dom_to_utc(tcal.dom_ticks())
                    .unwrap_or(UTC_UNDEFINED)
            }
        };

        self.dispatch_record(&tcal, gps.as_ref())?;
        self.stats.record(utc);
        Ok(utc)
    }

    /// Forwards the end-of-stream notification for this processor's mbid.
    ///
    /// # Errors
    ///
    /// Propagates the downstream consumer's failure.
    pub fn eos(&mut self) -> Result<(), ConsumerError> {
        self.consumer.end_of_stream(self.mbid)
    }

    fn update_rapcal(&mut self, tcal: &TimeCalib, gps: &GpsInfo) -> bool {
        match self.rapcal.update(tcal, gps.offset()) {
            Ok(()) => true,
            Err(e) => {
                // Logged and suppressed: the occasional bad calibration
                // must not take the stream down.
                warn!("rapcal rejected sample from {:012x}: {e}", self.mbid);
                self.stats.rapcal_errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn dispatch_record(
        &mut self,
        tcal: &TimeCalib,
        gps: Option<&GpsInfo>,
    ) -> Result<(), TcalError> {
        match self.dispatch_mode() {
            DispatchMode::Null => Ok(()),
            DispatchMode::Running => {
                if !self.consumer.has_consumer() {
                    return Ok(());
                }
                if gps.is_none() {
                    self.stats
                        .gps_missing_dispatches
                        .fetch_add(1, Ordering::Relaxed);
                }
                let record = format_record(self.mbid, tcal, gps);
                self.consumer
                    .consume(Bytes::from(record))
                    .map_err(TcalError::Consumer)
            }
        }
    }
}

impl std::fmt::Debug for TcalProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcalProcessor")
            .field("mbid", &format_args!("{:012x}", self.mbid))
            .field("processing", &self.processing)
            .field("dispatch", &self.dispatch_mode())
            .finish()
    }
}

impl BufferConsumer for TcalProcessor {
    fn consume(&mut self, buf: Bytes) -> Result<(), ConsumerError> {
        let daq = DaqBuffer::parse(buf)?;
        match self.process(daq.payload()) {
            Ok(_) => Ok(()),
            Err(TcalError::Consumer(e)) => Err(e),
            Err(TcalError::Record(e)) => Err(ConsumerError::Failed(e.to_string())),
        }
    }

    fn end_of_stream(&mut self, _mbid: u64) -> Result<(), ConsumerError> {
        self.eos()
    }
}

/// Builds the fixed-layout calibration record dispatched in RUNNING mode:
/// patched total length, format id, mbid, a reserved word, the module
/// tick, the uncompressed measurement block, and the 22-byte GPS block
/// (or the epoch-zero placeholder when no snapshot was available).
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn format_record(mbid: u64, tcal: &TimeCalib, gps: Option<&GpsInfo>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(500);
    buf.extend_from_slice(&0i32.to_be_bytes());
    buf.extend_from_slice(&MAGIC_TCAL_FMTID.to_be_bytes());
    buf.extend_from_slice(&mbid.to_be_bytes());
    buf.extend_from_slice(&0i64.to_be_bytes());
    buf.extend_from_slice(&tcal.dom_ticks().to_be_bytes());
    tcal.write_uncompressed(&mut buf);
    match gps {
        Some(g) => buf.extend_from_slice(g.wire()),
        None => buf.extend_from_slice(&GPS_EPOCH_PLACEHOLDER),
    }

    let total = buf.len() as i32;
    buf[0..4].copy_from_slice(&total.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HEADER_LEN;
    use crate::time::{TimeCalib, GPS_WIRE_LEN, TIME_CALIB_LEN, WAVEFORM_LEN};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Unity-ratio calibration with a 50 x 0.1ns cable delay.
    fn tcal_at(base: u64) -> TimeCalib {
        const SHIFT: u64 = 500_000;
        TimeCalib::new(
            base,
            base + 200,
            [0u16; WAVEFORM_LEN],
            base - SHIFT + 50,
            base - SHIFT + 150,
            [0u16; WAVEFORM_LEN],
        )
    }

    /// A calibration RAPCal will reject (negative cable delay).
    fn bad_tcal() -> TimeCalib {
        TimeCalib::new(
            1_000_000,
            1_000_100,
            [0u16; WAVEFORM_LEN],
            500_000,
            500_500,
            [0u16; WAVEFORM_LEN],
        )
    }

    fn payload(tcal: &TimeCalib) -> Vec<u8> {
        let mut bytes = Vec::new();
        tcal.write_uncompressed(&mut bytes);
        bytes
    }

    /// GPS provider replaying a fixed script of snapshots.
    struct ScriptedGps(Mutex<VecDeque<Option<GpsInfo>>>);

    impl ScriptedGps {
        fn new(script: Vec<Option<GpsInfo>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(script.into())))
        }
    }

    impl GpsProvider for ScriptedGps {
        fn gps_info(&self) -> Option<GpsInfo> {
            self.0.lock().unwrap().pop_front().flatten()
        }
    }

    fn gps(offset: i64) -> Option<GpsInfo> {
        Some(GpsInfo::new(offset, GPS_EPOCH_PLACEHOLDER))
    }

    #[derive(Clone, Default)]
    struct Collector {
        records: Arc<Mutex<Vec<Vec<u8>>>>,
        eos: Arc<Mutex<Vec<u64>>>,
    }

    impl BufferConsumer for Collector {
        fn consume(&mut self, buf: Bytes) -> Result<(), ConsumerError> {
            self.records.lock().unwrap().push(buf.to_vec());
            Ok(())
        }

        fn end_of_stream(&mut self, mbid: u64) -> Result<(), ConsumerError> {
            self.eos.lock().unwrap().push(mbid);
            Ok(())
        }
    }

    fn processor(script: Vec<Option<GpsInfo>>) -> (TcalProcessor, Collector) {
        let collector = Collector::default();
        let proc = TcalProcessor::new(
            0xABCD_EF01_2345,
            RapCal::new(),
            ScriptedGps::new(script),
            Box::new(collector.clone()),
        );
        (proc, collector)
    }

    #[test]
    fn test_establishes_after_two_updates() {
        let (mut proc, _) = processor(vec![gps(0), gps(0), gps(0), None]);

        // First successful update stays primordial: UTC undefined.
        assert_eq!(proc.process(&payload(&tcal_at(10_000_000))).unwrap(), UTC_UNDEFINED);
        assert_eq!(
            proc.processing_mode(),
            ProcessingMode::Primordial { valid_updates: 1 }
        );

        // The update taking the counter past one transitions and returns a
        // defined UTC on the same call.
        let utc = proc.process(&payload(&tcal_at(20_000_000))).unwrap();
        assert_eq!(proc.processing_mode(), ProcessingMode::Established);
        assert!(utc > 0);

        // Established keeps translating, and never transitions back.
        let utc = proc.process(&payload(&tcal_at(30_000_000))).unwrap();
        assert_eq!(proc.processing_mode(), ProcessingMode::Established);
        assert!(utc > 0);

        // Established survives a missing GPS snapshot.
        let utc = proc.process(&payload(&tcal_at(40_000_000))).unwrap();
        assert_eq!(proc.processing_mode(), ProcessingMode::Established);
        assert!(utc > 0);
    }

    #[test]
    fn test_gps_null_stays_primordial() {
        let (mut proc, _) = processor(vec![None, None, None]);

        for base in [10_000_000u64, 20_000_000, 30_000_000] {
            assert_eq!(proc.process(&payload(&tcal_at(base))).unwrap(), UTC_UNDEFINED);
        }
        assert_eq!(
            proc.processing_mode(),
            ProcessingMode::Primordial { valid_updates: 0 }
        );
    }

    #[test]
    fn test_failed_update_stays_primordial() {
        let (mut proc, _) = processor(vec![gps(0), gps(0)]);

        assert_eq!(proc.process(&payload(&bad_tcal())).unwrap(), UTC_UNDEFINED);
        assert_eq!(
            proc.processing_mode(),
            ProcessingMode::Primordial { valid_updates: 0 }
        );
        assert_eq!(proc.handle().stats().rapcal_errors(), 1);

        assert_eq!(proc.process(&payload(&tcal_at(10_000_000))).unwrap(), UTC_UNDEFINED);
        assert_eq!(
            proc.processing_mode(),
            ProcessingMode::Primordial { valid_updates: 1 }
        );
    }

    #[test]
    fn test_established_suppresses_update_errors() {
        let (mut proc, _) = processor(vec![gps(0); 4]);
        proc.process(&payload(&tcal_at(10_000_000))).unwrap();
        proc.process(&payload(&tcal_at(20_000_000))).unwrap();
        proc.process(&payload(&tcal_at(30_000_000))).unwrap();
        assert_eq!(proc.processing_mode(), ProcessingMode::Established);

        // A rejected sample still yields a defined UTC from the old map.
        let utc = proc.process(&payload(&bad_tcal())).unwrap();
        assert!(utc > 0);
        assert_eq!(proc.processing_mode(), ProcessingMode::Established);
        assert_eq!(proc.handle().stats().rapcal_errors(), 1);
    }

    #[test]
    fn test_null_dispatch_emits_nothing() {
        let (mut proc, collector) = processor(vec![gps(0); 3]);
        for base in [10_000_000u64, 20_000_000, 30_000_000] {
            proc.process(&payload(&tcal_at(base))).unwrap();
        }
        assert!(collector.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_running_dispatch_record_layout() {
        let (mut proc, collector) = processor(vec![gps(7); 2]);
        let handle = proc.handle();
        handle.run_level(RunLevel::Running);

        let tcal = tcal_at(10_000_000);
        proc.process(&payload(&tcal)).unwrap();

        let records = collector.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];

        // Patched length, then the format id at offset 4.
        let declared = i32::from_be_bytes(rec[0..4].try_into().unwrap());
        assert_eq!(declared as usize, rec.len());
        assert_eq!(rec.len(), 32 + TIME_CALIB_LEN + GPS_WIRE_LEN);
        let fmtid = i32::from_be_bytes(rec[4..8].try_into().unwrap());
        assert_eq!(fmtid, MAGIC_TCAL_FMTID);

        let mbid = u64::from_be_bytes(rec[8..16].try_into().unwrap());
        assert_eq!(mbid, 0xABCD_EF01_2345);

        let ticks = i64::from_be_bytes(rec[24..32].try_into().unwrap());
        assert_eq!(ticks, tcal.dom_ticks());
    }

    #[test]
    fn test_dispatch_gating_follows_run_level() {
        let (mut proc, collector) = processor(vec![gps(0); 4]);
        let handle = proc.handle();

        handle.run_level(RunLevel::Running);
        proc.process(&payload(&tcal_at(10_000_000))).unwrap();
        assert_eq!(collector.records.lock().unwrap().len(), 1);

        // Any non-RUNNING level silences dispatch.
        handle.run_level(RunLevel::Stopping);
        proc.process(&payload(&tcal_at(20_000_000))).unwrap();
        assert_eq!(collector.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_gps_missing_dispatch_uses_placeholder() {
        let (mut proc, collector) = processor(vec![None]);
        let handle = proc.handle();
        handle.run_level(RunLevel::Running);

        proc.process(&payload(&tcal_at(10_000_000))).unwrap();

        let records = collector.records.lock().unwrap();
        let rec = &records[0];
        assert_eq!(&rec[rec.len() - GPS_WIRE_LEN..], &GPS_EPOCH_PLACEHOLDER);
        assert_eq!(handle.stats().gps_missing_dispatches(), 1);
    }

    #[test]
    fn test_eos_forwards_own_mbid() {
        let (mut proc, collector) = processor(vec![]);
        proc.eos().unwrap();
        assert_eq!(*collector.eos.lock().unwrap(), vec![0xABCD_EF01_2345]);
    }

    #[test]
    fn test_consume_strips_raw_header() {
        let (mut proc, _) = processor(vec![gps(0)]);

        let tcal = tcal_at(10_000_000);
        let mut raw = vec![0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(&((HEADER_LEN + TIME_CALIB_LEN) as u32).to_be_bytes());
        raw[8..16].copy_from_slice(&0xABCD_EF01_2345u64.to_be_bytes());
        raw[24..32].copy_from_slice(&100i64.to_be_bytes());
        raw.extend_from_slice(&payload(&tcal));

        proc.consume(Bytes::from(raw)).unwrap();
        assert_eq!(proc.handle().stats().processed(), 1);
        assert_eq!(
            proc.processing_mode(),
            ProcessingMode::Primordial { valid_updates: 1 }
        );
    }

    #[test]
    fn test_stats_track_last_utc() {
        let (mut proc, _) = processor(vec![gps(0); 3]);
        let handle = proc.handle();

        proc.process(&payload(&tcal_at(10_000_000))).unwrap();
        assert_eq!(handle.stats().last_utc(), UTC_UNDEFINED);

        let utc = proc.process(&payload(&tcal_at(20_000_000))).unwrap();
        assert!(utc > 0);
        assert_eq!(handle.stats().last_utc(), utc);

        let utc = proc.process(&payload(&tcal_at(30_000_000))).unwrap();
        assert_eq!(handle.stats().last_utc(), utc);
        assert_eq!(handle.stats().processed(), 3);
        assert!(handle.translator().is_ready());
    }
}
