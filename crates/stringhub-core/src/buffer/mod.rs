//! # Raw DAQ Buffers
//!
//! Typed, read-only projection over the raw byte buffers emitted by optical
//! modules, plus construction of the end-of-stream sentinel.
//!
//! ## Wire Format
//!
//! Every raw buffer carries a 32-byte header:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |        LENGTH (4 bytes, BE)       |
//! +--------+--------+--------+--------+
//! |     FORMAT TAG (4 bytes, BE)      |
//! +--------+--------+--------+--------+
//! |        CHANNEL ID (8 bytes, BE)   |
//! |                                   |
//! +--------+--------+--------+--------+
//! |        RESERVED (8 bytes)         |
//! |                                   |
//! +--------+--------+--------+--------+
//! |        TIMESTAMP (8 bytes, BE)    |
//! |                                   |
//! +--------+--------+--------+--------+
//! |           PAYLOAD ...             |
//! +--------+--------+--------+--------+
//! ```
//!
//! The channel id is the module's 64-bit mainboard id. The timestamp is a
//! signed 64-bit count of 0.1-ns units since the run-local epoch and must be
//! monotone nondecreasing per channel. A timestamp equal to `i64::MAX` marks
//! the channel's end-of-stream sentinel.

use bytes::Bytes;

/// Length of the fixed raw-buffer header in bytes.
pub const HEADER_LEN: usize = 32;

/// Timestamp value reserved for the end-of-stream sentinel.
pub const EOS_TIMESTAMP: i64 = i64::MAX;

/// Errors raised when projecting a raw buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The buffer is shorter than the fixed header.
    #[error("raw buffer truncated: {actual} bytes, header needs {HEADER_LEN}")]
    Truncated {
        /// Actual number of bytes received.
        actual: usize,
    },

    /// The declared length field exceeds the bytes actually present.
    #[error("raw buffer length field {declared} exceeds actual size {actual}")]
    BadLength {
        /// Length field from the header.
        declared: u32,
        /// Actual number of bytes received.
        actual: usize,
    },
}

/// Read-only projection of a raw buffer exposing channel id and timestamp.
///
/// The view shares the underlying storage with the raw buffer; the bytes are
/// never copied. Ownership of the storage travels with the view and can be
/// recovered with [`DaqBuffer::into_bytes`] when handing the buffer to a
/// downstream consumer.
#[derive(Debug, Clone)]
pub struct DaqBuffer {
    bytes: Bytes,
    mbid: u64,
    timestamp: i64,
}

impl DaqBuffer {
    /// Projects a raw buffer, reading the fixed header offsets.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Truncated`] if fewer than [`HEADER_LEN`] bytes
    /// are present, or [`BufferError::BadLength`] if the header's length
    /// field points past the end of the buffer.
    pub fn parse(bytes: Bytes) -> Result<Self, BufferError> {
        if bytes.len() < HEADER_LEN {
            return Err(BufferError::Truncated {
                actual: bytes.len(),
            });
        }

        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if declared as usize > bytes.len() {
            return Err(BufferError::BadLength {
                declared,
                actual: bytes.len(),
            });
        }

        let mbid = u64::from_be_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ]);
        let timestamp = i64::from_be_bytes([
            bytes[24], bytes[25], bytes[26], bytes[27], bytes[28], bytes[29], bytes[30], bytes[31],
        ]);

        Ok(Self {
            bytes,
            mbid,
            timestamp,
        })
    }

    /// Returns the 64-bit channel (mainboard) id.
    #[inline]
    #[must_use]
    pub fn mbid(&self) -> u64 {
        self.mbid
    }

    /// Returns the timestamp in 0.1-ns units since the run-local epoch.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns the format/kind tag from the header.
    #[must_use]
    pub fn kind_tag(&self) -> u32 {
        u32::from_be_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    /// Returns the total buffer size in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the buffer holds no bytes.
    ///
    /// A parsed buffer always carries at least the header, so this is
    /// always false; provided for container-API symmetry.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the payload following the 32-byte header.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// Returns true if this buffer is the end-of-stream sentinel.
    #[inline]
    #[must_use]
    pub fn is_eos(&self) -> bool {
        self.timestamp == EOS_TIMESTAMP
    }

    /// Sort key ordering buffers by `(timestamp, mbid)` ascending.
    ///
    /// The mbid component makes ties across channels deterministic.
    #[inline]
    #[must_use]
    pub fn sort_key(&self) -> (i64, u64) {
        (self.timestamp, self.mbid)
    }

    /// Recovers the underlying storage, consuming the view.
    #[inline]
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Builds the 32-byte end-of-stream sentinel for a channel.
///
/// Layout: length=32, tag=0, the channel's mbid, zeroed reserved words, and
/// a timestamp of `i64::MAX`.
#[must_use]
pub fn eos(mbid: u64) -> Bytes {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&32u32.to_be_bytes());
    buf[8..16].copy_from_slice(&mbid.to_be_bytes());
    buf[24..32].copy_from_slice(&EOS_TIMESTAMP.to_be_bytes());
    Bytes::copy_from_slice(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(mbid: u64, timestamp: i64, payload: &[u8]) -> Bytes {
        let mut buf = vec![0u8; HEADER_LEN];
        let total = (HEADER_LEN + payload.len()) as u32;
        buf[0..4].copy_from_slice(&total.to_be_bytes());
        buf[4..8].copy_from_slice(&7u32.to_be_bytes());
        buf[8..16].copy_from_slice(&mbid.to_be_bytes());
        buf[24..32].copy_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }

    #[test]
    fn test_parse_header_fields() {
        let daq = DaqBuffer::parse(raw(0xA1B2_C3D4_E5F6_0708, 123_456_789, b"abc")).unwrap();
        assert_eq!(daq.mbid(), 0xA1B2_C3D4_E5F6_0708);
        assert_eq!(daq.timestamp(), 123_456_789);
        assert_eq!(daq.kind_tag(), 7);
        assert_eq!(daq.payload(), b"abc");
        assert_eq!(daq.len(), HEADER_LEN + 3);
        assert!(!daq.is_eos());
    }

    #[test]
    fn test_parse_truncated() {
        let err = DaqBuffer::parse(Bytes::from_static(&[0u8; 16])).unwrap_err();
        assert_eq!(err, BufferError::Truncated { actual: 16 });
    }

    #[test]
    fn test_parse_bad_length_field() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&64u32.to_be_bytes());
        let err = DaqBuffer::parse(Bytes::from(buf)).unwrap_err();
        assert_eq!(
            err,
            BufferError::BadLength {
                declared: 64,
                actual: HEADER_LEN
            }
        );
    }

    #[test]
    fn test_eos_sentinel_layout() {
        let sentinel = eos(0x0123_4567_89AB_CDEF);
        assert_eq!(sentinel.len(), 32);
        assert_eq!(&sentinel[0..4], &32u32.to_be_bytes());
        assert_eq!(&sentinel[4..8], &[0u8; 4]);
        assert_eq!(&sentinel[16..24], &[0u8; 8]);

        let daq = DaqBuffer::parse(sentinel).unwrap();
        assert_eq!(daq.mbid(), 0x0123_4567_89AB_CDEF);
        assert_eq!(daq.timestamp(), EOS_TIMESTAMP);
        assert!(daq.is_eos());
    }

    #[test]
    fn test_sort_key_tie_break() {
        let a = DaqBuffer::parse(raw(1, 100, b"")).unwrap();
        let b = DaqBuffer::parse(raw(2, 100, b"")).unwrap();
        assert!(a.sort_key() < b.sort_key());

        let later = DaqBuffer::parse(raw(1, 101, b"")).unwrap();
        assert!(b.sort_key() < later.sort_key());
    }

    #[test]
    fn test_view_shares_storage() {
        let bytes = raw(5, 50, b"payload");
        let daq = DaqBuffer::parse(bytes.clone()).unwrap();
        let recovered = daq.into_bytes();
        assert_eq!(recovered, bytes);
    }
}
