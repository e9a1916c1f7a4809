// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! BBB datagram format.
//!
//! BBB hubs transmit C structs in native byte order with natural x86-64
//! alignment, so the layouts below carry explicit padding:
//!
//! ```text
//! CommonHeader (40 bytes):
//!   0  packet_type:u8      (0x01 = optical, 0x02 = monitoring)
//!   2  plane_number:u16
//!   4  run_number:u32
//!   8  seq_number:u32
//!   16 window_start:{ year:u16, (pad), ticks_since_year:u64 }  (10 ns units)
//!   32 window_size:u32     (10 ns units)
//! OptHeader (48 bytes):
//!   0  CommonHeader
//!   40 window_flags:u8
//!   44 hit_count:u32
//! Hit (12 bytes):
//!   0  channel_and_flags:u8   (channel in the low nibble)
//!   4  timestamp:u32          (10 ns units since window start)
//!   8  tot:u16
//!   10 adc0:u16
//! ```

use crate::time::TaiTimestamp;
use byteorder::{ByteOrder, NativeEndian};

/// Packet type of an optical datagram.
pub const PACKET_TYPE_OPTICAL: u8 = 0x01;
/// Packet type of a monitoring datagram.
pub const PACKET_TYPE_MONITORING: u8 = 0x02;

/// Duration of one BBB clock tick in nanoseconds.
pub const TICK_NANOS: u64 = 10;

/// Wire size of [`BbbCommonHeader`].
pub const COMMON_HEADER_SIZE: usize = 40;

/// Wire size of [`BbbOptHeader`].
pub const OPT_HEADER_SIZE: usize = 48;

/// Wire size of one hit record.
pub const HIT_SIZE: usize = 12;

/// CPU-trigger flag in the high nibble of `channel_and_flags`.
pub const HIT_CPU_TRIGGER_FLAG: u8 = 0x10;

/// Window start on the hub clock: civil year plus 10 ns ticks since the
/// midnight of Jan 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbbWindowStart {
    pub year: u16,
    pub ticks_since_year: u64,
}

impl BbbWindowStart {
    /// TAI of the window start.
    pub fn to_tai(self) -> TaiTimestamp {
        let year_secs = days_to_year_start(self.year) * 86_400;
        let tick_nanos = self.ticks_since_year * TICK_NANOS;
        TaiTimestamp::new(year_secs, 0).add_nanos(tick_nanos)
    }
}

/// Days from 1970-01-01 to Jan 1 of `year`.
fn days_to_year_start(year: u16) -> u64 {
    let year = i64::from(year);
    let leaps = |y: i64| y / 4 - y / 100 + y / 400;
    let days = 365 * (year - 1970) + leaps(year - 1) - leaps(1969);
    days.max(0) as u64
}

/// Decoded BBB common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbbCommonHeader {
    pub packet_type: u8,
    pub plane_number: u16,
    pub run_number: u32,
    pub seq_number: u32,
    pub window_start: BbbWindowStart,
    /// Window duration in 10 ns units.
    pub window_size: u32,
}

impl BbbCommonHeader {
    /// Decode the common header. The caller has verified `buf` holds at
    /// least [`COMMON_HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            packet_type: buf[0],
            plane_number: NativeEndian::read_u16(&buf[2..4]),
            run_number: NativeEndian::read_u32(&buf[4..8]),
            seq_number: NativeEndian::read_u32(&buf[8..12]),
            window_start: BbbWindowStart {
                year: NativeEndian::read_u16(&buf[16..18]),
                ticks_since_year: NativeEndian::read_u64(&buf[24..32]),
            },
            window_size: NativeEndian::read_u32(&buf[32..36]),
        }
    }
}

/// Decoded BBB optical header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbbOptHeader {
    pub common: BbbCommonHeader,
    pub window_flags: u8,
    pub hit_count: u32,
}

impl BbbOptHeader {
    /// Decode the optical header. The caller has verified `buf` holds at
    /// least [`OPT_HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            common: BbbCommonHeader::decode(buf),
            window_flags: buf[40],
            hit_count: NativeEndian::read_u32(&buf[44..48]),
        }
    }
}

/// Decoded BBB hit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbbHit {
    pub channel_and_flags: u8,
    /// 10 ns units since the window start.
    pub timestamp: u32,
    pub tot: u16,
    pub adc0: u16,
}

impl BbbHit {
    /// Decode one hit record. The caller has verified `buf` holds at least
    /// [`HIT_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            channel_and_flags: buf[0],
            timestamp: NativeEndian::read_u32(&buf[4..8]),
            tot: NativeEndian::read_u16(&buf[8..10]),
            adc0: NativeEndian::read_u16(&buf[10..12]),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel_and_flags & 0x0F
    }

    pub fn cpu_trigger(&self) -> bool {
        self.channel_and_flags & HIT_CPU_TRIGGER_FLAG != 0
    }

    /// TAI of the hit: window start plus the 10 ns offset.
    pub fn time(&self, window_start: TaiTimestamp) -> TaiTimestamp {
        window_start.add_nanos(u64::from(self.timestamp) * TICK_NANOS)
    }
}

/// Encode an optical header + hits into a datagram. Test and simulation
/// helper.
pub fn encode_datagram(header: &BbbOptHeader, hits: &[BbbHit]) -> Vec<u8> {
    let mut buf = vec![0u8; OPT_HEADER_SIZE + hits.len() * HIT_SIZE];
    let common = &header.common;
    buf[0] = common.packet_type;
    NativeEndian::write_u16(&mut buf[2..4], common.plane_number);
    NativeEndian::write_u32(&mut buf[4..8], common.run_number);
    NativeEndian::write_u32(&mut buf[8..12], common.seq_number);
    NativeEndian::write_u16(&mut buf[16..18], common.window_start.year);
    NativeEndian::write_u64(&mut buf[24..32], common.window_start.ticks_since_year);
    NativeEndian::write_u32(&mut buf[32..36], common.window_size);
    buf[40] = header.window_flags;
    NativeEndian::write_u32(&mut buf[44..48], header.hit_count);
    for (i, hit) in hits.iter().enumerate() {
        let at = OPT_HEADER_SIZE + i * HIT_SIZE;
        buf[at] = hit.channel_and_flags;
        NativeEndian::write_u32(&mut buf[at + 4..at + 8], hit.timestamp);
        NativeEndian::write_u16(&mut buf[at + 8..at + 10], hit.tot);
        NativeEndian::write_u16(&mut buf[at + 10..at + 12], hit.adc0);
    }
    buf
}
