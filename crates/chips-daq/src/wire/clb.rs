// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! CLB datagram format.
//!
//! ```text
//! Header (40 bytes, packed, big-endian):
//!   data_type:u32  run_number:u32  seq_number:u32
//!   timestamp_secs:u32  timestamp_ticks:u32   (ticks = 16 ns units)
//!   plane_id:u32  status1:u32 .. status4:u32
//! Hit (6 bytes, packed):
//!   channel:u8  timestamp_ns:u32 (relative to the header)  tot:u8
//! ```

use crate::time::TaiTimestamp;
use byteorder::{BigEndian, ByteOrder};

/// Data type code of an optical datagram.
pub const DATA_TYPE_OPTICAL: u32 = 0x5444_4300;
/// Data type code of an acoustic datagram.
pub const DATA_TYPE_ACOUSTIC: u32 = 0x5441_4553;
/// Data type code of a monitoring datagram.
pub const DATA_TYPE_MONITORING: u32 = 0x544D_4348;

/// Duration of one CLB clock tick in nanoseconds.
pub const TICK_NANOS: u64 = 16;

/// Wire size of [`ClbCommonHeader`].
pub const HEADER_SIZE: usize = 40;

/// Wire size of one hit record.
pub const HIT_SIZE: usize = 6;

/// Decoded CLB common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClbCommonHeader {
    pub data_type: u32,
    pub run_number: u32,
    pub seq_number: u32,
    pub timestamp_secs: u32,
    /// 16 ns units within the second.
    pub timestamp_ticks: u32,
    pub plane_id: u32,
    pub status: [u32; 4],
}

impl ClbCommonHeader {
    /// Decode the leading header. The caller has verified `buf` holds at
    /// least [`HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            data_type: BigEndian::read_u32(&buf[0..4]),
            run_number: BigEndian::read_u32(&buf[4..8]),
            seq_number: BigEndian::read_u32(&buf[8..12]),
            timestamp_secs: BigEndian::read_u32(&buf[12..16]),
            timestamp_ticks: BigEndian::read_u32(&buf[16..20]),
            plane_id: BigEndian::read_u32(&buf[20..24]),
            status: [
                BigEndian::read_u32(&buf[24..28]),
                BigEndian::read_u32(&buf[28..32]),
                BigEndian::read_u32(&buf[32..36]),
                BigEndian::read_u32(&buf[36..40]),
            ],
        }
    }

    pub fn is_optical(&self) -> bool {
        self.data_type == DATA_TYPE_OPTICAL
    }

    /// Human-readable name of the datagram class, for log lines.
    pub fn data_type_name(&self) -> &'static str {
        match self.data_type {
            DATA_TYPE_OPTICAL => "optical",
            DATA_TYPE_ACOUSTIC => "acoustic",
            DATA_TYPE_MONITORING => "monitoring",
            _ => "unknown",
        }
    }

    /// The status1 MSB flags a White-Rabbit-valid timestamp.
    pub fn timestamp_valid(&self) -> bool {
        self.status[0] & 0x8000_0000 != 0
    }

    /// The status2 MSB flags the trailer datagram of a window.
    pub fn is_trailer(&self) -> bool {
        self.status[1] & 0x8000_0000 != 0
    }

    /// TAI of the datagram window start: `secs + 16 ns * ticks`.
    pub fn window_start(&self) -> TaiTimestamp {
        let mut time = TaiTimestamp::new(
            u64::from(self.timestamp_secs),
            (u64::from(self.timestamp_ticks) * TICK_NANOS) as u32,
        );
        time.normalise();
        time
    }
}

/// Decoded CLB hit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClbHit {
    pub channel: u8,
    /// Nanoseconds since the datagram window start.
    pub timestamp_ns: u32,
    pub tot: u8,
}

impl ClbHit {
    /// Decode one hit record. The caller has verified `buf` holds at least
    /// [`HIT_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            channel: buf[0],
            timestamp_ns: BigEndian::read_u32(&buf[1..5]),
            tot: buf[5],
        }
    }
}

/// Encode a header + hits into an optical datagram. Test and simulation
/// helper; the shore side never transmits on the data ports.
pub fn encode_datagram(header: &ClbCommonHeader, hits: &[ClbHit]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + hits.len() * HIT_SIZE];
    BigEndian::write_u32(&mut buf[0..4], header.data_type);
    BigEndian::write_u32(&mut buf[4..8], header.run_number);
    BigEndian::write_u32(&mut buf[8..12], header.seq_number);
    BigEndian::write_u32(&mut buf[12..16], header.timestamp_secs);
    BigEndian::write_u32(&mut buf[16..20], header.timestamp_ticks);
    BigEndian::write_u32(&mut buf[20..24], header.plane_id);
    for (i, status) in header.status.iter().enumerate() {
        BigEndian::write_u32(&mut buf[24 + 4 * i..28 + 4 * i], *status);
    }
    for (i, hit) in hits.iter().enumerate() {
        let at = HEADER_SIZE + i * HIT_SIZE;
        buf[at] = hit.channel;
        BigEndian::write_u32(&mut buf[at + 1..at + 5], hit.timestamp_ns);
        buf[at + 5] = hit.tot;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> ClbCommonHeader {
        ClbCommonHeader {
            data_type: DATA_TYPE_OPTICAL,
            run_number: 7,
            seq_number: 3,
            timestamp_secs: 100,
            timestamp_ticks: 2,
            plane_id: 42,
            status: [0x8000_0000, 0, 0, 0],
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let wire = encode_datagram(&header, &[]);
        assert_eq!(wire.len(), HEADER_SIZE);
        assert_eq!(ClbCommonHeader::decode(&wire), header);
    }

    #[test]
    fn test_header_is_big_endian_on_the_wire() {
        let wire = encode_datagram(&sample_header(), &[]);
        // data_type 0x54444300 -> "TDC\0" in network order.
        assert_eq!(&wire[0..4], &[0x54, 0x44, 0x43, 0x00]);
        // plane_id 42 in the high word's last byte.
        assert_eq!(&wire[20..24], &[0, 0, 0, 42]);
    }

    #[test]
    fn test_window_start_folds_ticks() {
        let header = sample_header();
        assert_eq!(header.window_start(), TaiTimestamp::new(100, 32));

        let mut wrap = sample_header();
        wrap.timestamp_ticks = 62_500_000; // exactly one second
        assert_eq!(wrap.window_start(), TaiTimestamp::new(101, 0));
    }

    #[test]
    fn test_hit_roundtrip() {
        let hits = [
            ClbHit { channel: 3, timestamp_ns: 500, tot: 5 },
            ClbHit { channel: 12, timestamp_ns: 0x0102_0304, tot: 255 },
        ];
        let wire = encode_datagram(&sample_header(), &hits);
        assert_eq!(wire.len(), HEADER_SIZE + 2 * HIT_SIZE);
        assert_eq!(ClbHit::decode(&wire[HEADER_SIZE..]), hits[0]);
        assert_eq!(ClbHit::decode(&wire[HEADER_SIZE + HIT_SIZE..]), hits[1]);
        // The intra-window offset is big-endian too.
        assert_eq!(
            &wire[HEADER_SIZE + HIT_SIZE + 1..HEADER_SIZE + HIT_SIZE + 5],
            &[0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn test_status_flags() {
        let header = sample_header();
        assert!(header.timestamp_valid());
        assert!(!header.is_trailer());

        let mut trailer = sample_header();
        trailer.status[1] = 0x8000_0000;
        assert!(trailer.is_trailer());
    }

    #[test]
    fn test_type_classification() {
        assert!(sample_header().is_optical());
        let mut moni = sample_header();
        moni.data_type = DATA_TYPE_MONITORING;
        assert!(!moni.is_optical());
        assert_eq!(moni.data_type_name(), "monitoring");
    }
}
