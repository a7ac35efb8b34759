//! GPS 1PPS snapshots.
//!
//! Each readout card carries a GPS receiver whose one-pulse-per-second
//! output is latched against the host clock. A snapshot pairs the measured
//! offset (0.1-ns units) with the 22-byte wire block the card produced:
//!
//! ```text
//! +------+---------------+------+------------------------+
//! | SOH  | DDD:HH:MM:SS  | ' '  |  QUALITY (8 bytes, BE) |
//! | 0x01 |  (12 bytes)   |      |                        |
//! +------+---------------+------+------------------------+
//! ```

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Length of the GPS wire block in bytes.
pub const GPS_WIRE_LEN: usize = 22;

/// Wire block representing "GPS epoch zero", used when a record must be
/// emitted but no snapshot was available this cycle.
pub const GPS_EPOCH_PLACEHOLDER: [u8; GPS_WIRE_LEN] =
    *b"\x01001:00:00:00 \0\0\0\0\0\0\0\0";

/// One GPS 1PPS snapshot: offset to the host clock plus the raw wire block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpsInfo {
    offset: i64,
    wire: [u8; GPS_WIRE_LEN],
}

impl GpsInfo {
    /// Wraps an offset (0.1-ns units) and a raw 22-byte wire block.
    #[must_use]
    pub fn new(offset: i64, wire: [u8; GPS_WIRE_LEN]) -> Self {
        Self { offset, wire }
    }

    /// Builds a snapshot for a wall-clock instant.
    ///
    /// The day-of-year field uses the 1-based `DDD` convention, so January
    /// 1st reads `001`, matching [`GPS_EPOCH_PLACEHOLDER`].
    #[must_use]
    pub fn at(time: DateTime<Utc>, quality: i64, offset: i64) -> Self {
        let mut wire = [0u8; GPS_WIRE_LEN];
        wire[0] = 0x01;
        let stamp = format!(
            "{:03}:{:02}:{:02}:{:02} ",
            time.ordinal(),
            time.hour(),
            time.minute(),
            time.second()
        );
        wire[1..14].copy_from_slice(stamp.as_bytes());
        wire[14..22].copy_from_slice(&quality.to_be_bytes());
        Self { offset, wire }
    }

    /// Returns the 1PPS offset in 0.1-ns units.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Returns the 22-byte wire block.
    #[inline]
    #[must_use]
    pub fn wire(&self) -> &[u8; GPS_WIRE_LEN] {
        &self.wire
    }

    /// Returns the quality field from the wire block.
    #[must_use]
    pub fn quality(&self) -> i64 {
        let mut q = [0u8; 8];
        q.copy_from_slice(&self.wire[14..22]);
        i64::from_be_bytes(q)
    }
}

/// Source of GPS snapshots for a card.
///
/// `gps_info` returns `None` when no snapshot is available this cycle;
/// callers must tolerate that. The provider is a plain handle so tests and
/// simulation can substitute their own source.
pub trait GpsProvider: Send + Sync {
    /// Returns the current snapshot, if one is available.
    fn gps_info(&self) -> Option<GpsInfo>;
}

/// Provider that always yields the same snapshot. Used by simulated hubs.
#[derive(Debug, Clone, Copy)]
pub struct FixedGps(
    /// The snapshot returned on every call.
    pub GpsInfo,
);

impl GpsProvider for FixedGps {
    fn gps_info(&self) -> Option<GpsInfo> {
        Some(self.0)
    }
}

/// Provider for cards without a GPS feed; always yields `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGps;

impl GpsProvider for NoGps {
    fn gps_info(&self) -> Option<GpsInfo> {
        None
    }
}
