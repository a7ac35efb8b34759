//! # Time Module
//!
//! Clock translation between module-local oscillators and detector UTC.
//!
//! ## Concepts
//!
//! - **Detector UTC**: integer tenths of nanoseconds since the run-local
//!   epoch; the unit every merged stream is ordered by
//! - **Module clock**: a DOM's free-running oscillator, read out in 0.1-ns
//!   units and in 250-unit ticks
//! - **TCAL**: one round-trip measurement timestamped in both clock
//!   domains ([`TimeCalib`])
//! - **GPS 1PPS offset**: the measured 0.1-ns offset from a card's GPS
//!   pulse to the host clock ([`GpsInfo`])
//! - **RAPCal**: the algorithm combining TCAL and GPS samples into an
//!   affine module-to-UTC map ([`RapCal`])
//!
//! ## Translation
//!
//! ```rust
//! use stringhub_core::time::RapCal;
//!
//! let mut rapcal = RapCal::new();
//! // ... two accepted updates later ...
//! assert_eq!(rapcal.dom_to_utc(1000), None); // primordial: undefined
//! ```
//!
//! Readers on other threads hold a [`UtcTranslator`], which loads the
//! atomically published snapshot once per call.

mod gps;
mod rapcal;

pub use gps::{FixedGps, GpsInfo, GpsProvider, NoGps, GPS_EPOCH_PLACEHOLDER, GPS_WIRE_LEN};
pub use rapcal::{
    AffineMap, RapCal, RapCalError, TimeCalib, UtcTranslator, TIME_CALIB_LEN, WAVEFORM_LEN,
};
