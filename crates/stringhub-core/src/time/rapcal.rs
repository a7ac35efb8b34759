//! RAPCal: module-clock to UTC translation.
//!
//! Every optical module free-runs its own oscillator. A TCAL round trip
//! timestamps one message in both clock domains (DOR transmit/receive on
//! the host side, DOM receive/transmit on the module side); combining the
//! round-trip midpoints with the card's GPS 1PPS offset yields matched
//! `(module time, UTC)` pairs. RAPCal keeps a bounded window of accepted
//! pairs and, from the two most recent (the wild cards), maintains the
//! affine translation
//!
//! ```text
//! utc = utc_ref + slope * (dom - dom_ref)
//! ```
//!
//! anchored at the newest pair so the f64 arithmetic only ever sees small
//! deltas.
//!
//! ## Concurrency
//!
//! One writer (the TCAL processor) calls `update`; many readers translate
//! timestamps concurrently. The map is published as an immutable snapshot
//! behind an atomic swap, so `dom_to_utc` never takes a lock.
//!
//! ## Failure policy
//!
//! A rejected sample leaves all state untouched. Occasional bad TCAL
//! round trips are expected; callers log and carry on with the previous
//! window.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Size of the uncompressed TCAL measurement block in bytes.
pub const TIME_CALIB_LEN: usize = 288;

/// Samples per waveform in a TCAL measurement.
pub const WAVEFORM_LEN: usize = 64;

/// Number of accepted samples retained in the window.
const HISTORY: usize = 16;

/// Upper bound on the one-way cable delay, in 0.1-ns units (10 us).
const MAX_CABLE_DELAY: f64 = 100_000.0;

/// Largest tolerated deviation of the DOM/DOR clock ratio from unity.
const MAX_RATIO_DEVIATION: f64 = 1.0e-4;

/// Largest tolerated step between consecutive GPS offsets, in 0.1-ns
/// units (1 ms). A bigger step means the snapshot is stale or the feed
/// glitched.
const MAX_GPS_STEP: i64 = 10_000_000;

/// Errors rejecting a TCAL sample. All are non-fatal to the pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RapCalError {
    /// The measurement block was shorter than [`TIME_CALIB_LEN`].
    #[error("time-calibration record truncated: {actual} bytes, need {TIME_CALIB_LEN}")]
    MalformedRecord {
        /// Actual number of bytes received.
        actual: usize,
    },

    /// The round trip was implausible (negative or oversized cable delay).
    #[error("anomalous round trip: cable delay {delay} x 0.1ns")]
    AnomalousRoundTrip {
        /// Inferred one-way cable delay in 0.1-ns units.
        delay: f64,
    },

    /// The sample's midpoints did not advance past the previous sample's.
    #[error("non-monotonic time-calibration sample")]
    NonMonotonicSample,

    /// The pairwise clock ratio strayed too far from unity.
    #[error("clock ratio out of bounds: {ratio}")]
    ClockRatioOutOfBounds {
        /// Measured DOM/DOR ratio.
        ratio: f64,
    },

    /// The GPS offset jumped by more than the stale-snapshot bound.
    #[error("GPS offset stepped by {delta} x 0.1ns")]
    StaleGpsOffset {
        /// Offset step relative to the previous accepted sample.
        delta: i64,
    },
}

/// One uncompressed TCAL round-trip measurement.
///
/// All four timestamps are in 0.1-ns units of their own clock domain. The
/// waveforms digitize the received pulse edges and travel with the record
/// for downstream fine-delay analysis; RAPCal itself uses the midpoints
/// only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeCalib {
    dor_tx: u64,
    dor_rx: u64,
    dor_waveform: [u16; WAVEFORM_LEN],
    dom_rx: u64,
    dom_tx: u64,
    dom_waveform: [u16; WAVEFORM_LEN],
}

impl TimeCalib {
    /// Assembles a measurement from its four timestamps and waveforms.
    #[must_use]
    pub fn new(
        dor_tx: u64,
        dor_rx: u64,
        dor_waveform: [u16; WAVEFORM_LEN],
        dom_rx: u64,
        dom_tx: u64,
        dom_waveform: [u16; WAVEFORM_LEN],
    ) -> Self {
        Self {
            dor_tx,
            dor_rx,
            dor_waveform,
            dom_rx,
            dom_tx,
            dom_waveform,
        }
    }

    /// Decodes the 288-byte big-endian measurement block.
    ///
    /// # Errors
    ///
    /// Returns [`RapCalError::MalformedRecord`] on short input.
    pub fn parse(bytes: &[u8]) -> Result<Self, RapCalError> {
        if bytes.len() < TIME_CALIB_LEN {
            return Err(RapCalError::MalformedRecord {
                actual: bytes.len(),
            });
        }

        let read_u64 = |offset: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[offset..offset + 8]);
            u64::from_be_bytes(b)
        };
        let read_waveform = |offset: usize| {
            let mut wf = [0u16; WAVEFORM_LEN];
            for (i, w) in wf.iter_mut().enumerate() {
                *w = u16::from_be_bytes([bytes[offset + 2 * i], bytes[offset + 2 * i + 1]]);
            }
            wf
        };

        Ok(Self {
            dor_tx: read_u64(0),
            dor_rx: read_u64(8),
            dor_waveform: read_waveform(16),
            dom_rx: read_u64(144),
            dom_tx: read_u64(152),
            dom_waveform: read_waveform(160),
        })
    }

    /// Re-emits the uncompressed 288-byte block, appending to `out`.
    pub fn write_uncompressed(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.dor_tx.to_be_bytes());
        out.extend_from_slice(&self.dor_rx.to_be_bytes());
        for w in &self.dor_waveform {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out.extend_from_slice(&self.dom_rx.to_be_bytes());
        out.extend_from_slice(&self.dom_tx.to_be_bytes());
        for w in &self.dom_waveform {
            out.extend_from_slice(&w.to_be_bytes());
        }
    }

    /// DOM transmit time in 0.1-ns units of the module clock.
    #[inline]
    #[must_use]
    pub fn dom_tx(&self) -> u64 {
        self.dom_tx
    }

    /// DOM transmit time in module clock ticks (`dom_tx / 250`).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // module uptimes never reach i64::MAX ticks
    pub fn dom_ticks(&self) -> i64 {
        (self.dom_tx / 250) as i64
    }
}

/// One accepted `(module time, UTC)` pair.
#[derive(Debug, Clone, Copy)]
struct Sample {
    dom_mid: f64,
    utc_mid: f64,
    gps_offset: i64,
}

/// Immutable affine-map snapshot published to readers.
#[derive(Debug, Clone, Copy)]
pub struct AffineMap {
    /// UTC units per module-clock unit.
    pub slope: f64,
    /// Module-time anchor (0.1-ns units).
    pub dom_ref: f64,
    /// UTC anchor (0.1-ns units).
    pub utc_ref: f64,
    /// Monotone publication counter.
    pub generation: u64,
}

impl AffineMap {
    /// Translates a module tick (250 x 0.1 ns) to UTC in 0.1-ns units.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn dom_to_utc(&self, dom_ticks: i64) -> i64 {
        let dom = dom_ticks as f64 * 250.0;
        (self.utc_ref + self.slope * (dom - self.dom_ref)).round() as i64
    }
}

/// Cheaply cloneable reader handle over the published affine map.
///
/// Safe against a concurrent `update`: each call loads one snapshot.
#[derive(Clone)]
pub struct UtcTranslator {
    map: Arc<ArcSwapOption<AffineMap>>,
}

impl UtcTranslator {
    /// True once two samples have been accepted and a map is published.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.map.load().is_some()
    }

    /// Translates a module tick to UTC; `None` before the map exists.
    #[must_use]
    pub fn dom_to_utc(&self, dom_ticks: i64) -> Option<i64> {
        self.map.load().as_ref().map(|m| m.dom_to_utc(dom_ticks))
    }
}

impl std::fmt::Debug for UtcTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtcTranslator")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// The clock-translation state machine: bounded sample window, wild-card
/// pair, and atomic map publication.
pub struct RapCal {
    window: VecDeque<Sample>,
    map: Arc<ArcSwapOption<AffineMap>>,
    generation: u64,
    accepted: u64,
    rejected: u64,
}

impl RapCal {
    /// Creates an empty (primordial) instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(HISTORY),
            map: Arc::new(ArcSwapOption::empty()),
            generation: 0,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Ingests one TCAL measurement plus the concurrent GPS 1PPS offset.
    ///
    /// On success the window advances and the affine map is recomputed
    /// from the two newest samples and published atomically. On failure
    /// the state is unchanged.
    ///
    /// # Errors
    ///
    /// Any [`RapCalError`]; one bad sample does not poison the window.
    #[allow(clippy::cast_precision_loss)] // run-local 0.1ns values stay far below 2^53
    pub fn update(&mut self, tcal: &TimeCalib, gps_offset: i64) -> Result<(), RapCalError> {
        let result = self.validate(tcal, gps_offset);
        match result {
            Ok(sample) => {
                if self.window.len() == HISTORY {
                    self.window.pop_front();
                }
                self.window.push_back(sample);
                self.accepted += 1;
                self.republish();
                Ok(())
            }
            Err(e) => {
                self.rejected += 1;
                Err(e)
            }
        }
    }

    /// Translates a module tick to UTC; `None` in the primordial regime.
    #[must_use]
    pub fn dom_to_utc(&self, dom_ticks: i64) -> Option<i64> {
        self.map.load().as_ref().map(|m| m.dom_to_utc(dom_ticks))
    }

    /// True once the translation is defined.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.map.load().is_some()
    }

    /// Returns a reader handle sharing this instance's published map.
    #[must_use]
    pub fn translator(&self) -> UtcTranslator {
        UtcTranslator {
            map: Arc::clone(&self.map),
        }
    }

    /// Number of accepted samples.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Number of rejected samples.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    #[allow(clippy::cast_precision_loss)]
    fn validate(&self, tcal: &TimeCalib, gps_offset: i64) -> Result<Sample, RapCalError> {
        // Round-trip plausibility: the DOR leg must enclose the DOM leg
        // by a nonnegative cable delay below the bound.
        let rt_dor = tcal.dor_rx.wrapping_sub(tcal.dor_tx) as i64;
        let rt_dom = tcal.dom_tx.wrapping_sub(tcal.dom_rx) as i64;
        let delay = (rt_dor as f64 - rt_dom as f64) / 2.0;
        if rt_dor <= 0 || rt_dom < 0 || delay < 0.0 || delay > MAX_CABLE_DELAY {
            return Err(RapCalError::AnomalousRoundTrip { delay });
        }

        let dom_mid = (tcal.dom_rx as f64 + tcal.dom_tx as f64) / 2.0;
        let utc_mid = (tcal.dor_tx as f64 + tcal.dor_rx as f64) / 2.0 + gps_offset as f64;

        if let Some(last) = self.window.back() {
            if dom_mid <= last.dom_mid || utc_mid <= last.utc_mid {
                return Err(RapCalError::NonMonotonicSample);
            }

            let delta = gps_offset - last.gps_offset;
            if delta.abs() > MAX_GPS_STEP {
                return Err(RapCalError::StaleGpsOffset { delta });
            }

            let ratio = (utc_mid - last.utc_mid) / (dom_mid - last.dom_mid);
            if (ratio - 1.0).abs() > MAX_RATIO_DEVIATION {
                return Err(RapCalError::ClockRatioOutOfBounds { ratio });
            }
        }

        Ok(Sample {
            dom_mid,
            utc_mid,
            gps_offset,
        })
    }

    /// Recomputes the map from the two wild cards and swaps it in.
    fn republish(&mut self) {
        let len = self.window.len();
        if len < 2 {
            return;
        }
        let older = self.window[len - 2];
        let newer = self.window[len - 1];

        self.generation += 1;
        let map = AffineMap {
            slope: (newer.utc_mid - older.utc_mid) / (newer.dom_mid - older.dom_mid),
            dom_ref: newer.dom_mid,
            utc_ref: newer.utc_mid,
            generation: self.generation,
        };
        self.map.store(Some(Arc::new(map)));
    }
}

impl Default for RapCal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RapCal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RapCal")
            .field("window", &self.window.len())
            .field("accepted", &self.accepted)
            .field("rejected", &self.rejected)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Round trip with a 50 x 0.1ns cable delay and unity clock ratio:
    /// the DOM clock reads `base - SHIFT` when UTC reads `base + offset`.
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

    #[test]
    fn test_parse_roundtrip() {
        let tcal = TimeCalib::new(
            11,
            22,
            [3u16; WAVEFORM_LEN],
            44,
            55,
            [6u16; WAVEFORM_LEN],
        );
        let mut bytes = Vec::new();
        tcal.write_uncompressed(&mut bytes);
        assert_eq!(bytes.len(), TIME_CALIB_LEN);

        let parsed = TimeCalib::parse(&bytes).unwrap();
        assert_eq!(parsed, tcal);
    }

    #[test]
    fn test_parse_truncated() {
        let err = TimeCalib::parse(&[0u8; 100]).unwrap_err();
        assert_eq!(err, RapCalError::MalformedRecord { actual: 100 });
    }

    #[test]
    fn test_dom_ticks_conversion() {
        let tcal = TimeCalib::new(0, 200, [0; WAVEFORM_LEN], 0, 25_000, [0; WAVEFORM_LEN]);
        assert_eq!(tcal.dom_ticks(), 100);
    }

    #[test]
    fn test_primordial_undefined() {
        let mut rapcal = RapCal::new();
        assert!(!rapcal.is_ready());
        assert_eq!(rapcal.dom_to_utc(0), None);

        rapcal.update(&tcal_at(1_000_000), 0).unwrap();
        // One sample is not enough to fix slope and offset.
        assert!(!rapcal.is_ready());
        assert_eq!(rapcal.dom_to_utc(0), None);
    }

    #[test]
    fn test_two_samples_establish_translation() {
        let mut rapcal = RapCal::new();
        rapcal.update(&tcal_at(10_000_000), 0).unwrap();
        rapcal.update(&tcal_at(20_000_000), 0).unwrap();
        assert!(rapcal.is_ready());
        assert_eq!(rapcal.accepted(), 2);

        // Unity slope, so utc = dom + SHIFT(500_000) - 100 + 100 midpoint
        // algebra: dom_mid = base - 500_000 + 100, utc_mid = base + 100.
        // Hence utc = dom + 500_000 for any dom.
        let dom_ticks = 80_000; // dom = 20_000_000
        assert_eq!(rapcal.dom_to_utc(dom_ticks), Some(20_500_000));
    }

    #[test]
    fn test_anomalous_round_trip_rejected() {
        let mut rapcal = RapCal::new();
        // DOM leg longer than the DOR leg: negative cable delay.
        let bad = TimeCalib::new(
            1_000_000,
            1_000_100,
            [0; WAVEFORM_LEN],
            500_000,
            500_500,
            [0; WAVEFORM_LEN],
        );
        let err = rapcal.update(&bad, 0).unwrap_err();
        assert!(matches!(err, RapCalError::AnomalousRoundTrip { .. }));
        assert_eq!(rapcal.rejected(), 1);
        assert_eq!(rapcal.accepted(), 0);
    }

    #[test]
    fn test_bad_sample_leaves_state_unchanged() {
        let mut rapcal = RapCal::new();
        rapcal.update(&tcal_at(10_000_000), 0).unwrap();
        rapcal.update(&tcal_at(20_000_000), 0).unwrap();
        let before = rapcal.dom_to_utc(80_000);

        // Non-monotonic sample: midpoints regress.
        let err = rapcal.update(&tcal_at(15_000_000), 0).unwrap_err();
        assert_eq!(err, RapCalError::NonMonotonicSample);

        // Translation continues from the prior window.
        assert_eq!(rapcal.dom_to_utc(80_000), before);
        assert_eq!(rapcal.accepted(), 2);
        assert_eq!(rapcal.rejected(), 1);
    }

    #[test]
    fn test_clock_ratio_bound() {
        let mut rapcal = RapCal::new();
        rapcal.update(&tcal_at(10_000_000), 0).unwrap();

        // DOR advanced 10ms but DOM only 5ms: ratio 2.
        let skewed = TimeCalib::new(
            20_000_000,
            20_000_200,
            [0; WAVEFORM_LEN],
            14_500_050,
            14_500_150,
            [0; WAVEFORM_LEN],
        );
        let err = rapcal.update(&skewed, 0).unwrap_err();
        assert!(matches!(err, RapCalError::ClockRatioOutOfBounds { .. }));
    }

    #[test]
    fn test_stale_gps_offset_rejected() {
        let mut rapcal = RapCal::new();
        rapcal.update(&tcal_at(10_000_000), 1000).unwrap();

        let err = rapcal
            .update(&tcal_at(20_000_000), 1000 + MAX_GPS_STEP + 1)
            .unwrap_err();
        assert!(matches!(err, RapCalError::StaleGpsOffset { .. }));
    }

    #[test]
    fn test_gps_offset_shifts_utc() {
        let mut rapcal = RapCal::new();
        rapcal.update(&tcal_at(10_000_000), 7000).unwrap();
        rapcal.update(&tcal_at(20_000_000), 7000).unwrap();

        assert_eq!(rapcal.dom_to_utc(80_000), Some(20_500_000 + 7000));
    }

    #[test]
    fn test_translator_tracks_updates() {
        let mut rapcal = RapCal::new();
        let translator = rapcal.translator();
        assert!(!translator.is_ready());

        rapcal.update(&tcal_at(10_000_000), 0).unwrap();
        rapcal.update(&tcal_at(20_000_000), 0).unwrap();

        assert!(translator.is_ready());
        assert_eq!(translator.dom_to_utc(80_000), rapcal.dom_to_utc(80_000));

        // Another update republishes; the translator sees the new map.
        rapcal.update(&tcal_at(30_000_000), 0).unwrap();
        assert_eq!(translator.dom_to_utc(120_000), Some(30_500_000));
    }

    #[test]
    fn test_window_stays_bounded() {
        let mut rapcal = RapCal::new();
        for i in 0..100u64 {
            rapcal
                .update(&tcal_at(10_000_000 + i * 1_000_000), 0)
                .unwrap();
        }
        assert_eq!(rapcal.accepted(), 100);
        assert!(rapcal.window.len() <= HISTORY);
    }
}
