// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! BBB optical stream processing.

use crate::hit::Hit;
use crate::receiver::{DatagramProcessor, ReceiverContext};
use crate::time::TaiTimestamp;
use crate::wire::bbb::{self, BbbHit, BbbOptHeader};
use std::sync::atomic::Ordering;

/// Datagram processor for the BBB optical format.
pub struct BbbProcessor {
    port: u16,
}

impl BbbProcessor {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    fn mine_hits(
        &self,
        datagram: &[u8],
        n_hits: usize,
        base_time: TaiTimestamp,
        plane_number: u32,
        ctx: &mut ReceiverContext,
    ) {
        let Some(spill) = ctx.schedule.find_open_spill(base_time) else {
            // Have no slot to store the hits, discard datagram.
            ctx.stats.unmatched_datagrams.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let slot = spill.slot(ctx.data_slot_idx);
        let Some(mut queues) = slot.lock_for_writing() else {
            ctx.stats.unmatched_datagrams.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let queue = queues.queue_for_writing(plane_number);
        queue.reserve(n_hits);
        for i in 0..n_hits {
            let at = bbb::OPT_HEADER_SIZE + i * bbb::HIT_SIZE;
            let wire_hit = BbbHit::decode(&datagram[at..at + bbb::HIT_SIZE]);

            queue.push(Hit {
                plane_number,
                channel_number: wire_hit.channel(),
                timestamp: wire_hit.time(base_time),
                // The wire carries 16-bit fields; the archived hit keeps
                // the saturated low byte.
                tot: wire_hit.tot.min(u16::from(u8::MAX)) as u8,
                adc0: wire_hit.adc0.min(u16::from(u8::MAX)) as u8,
                cpu_trigger: wire_hit.cpu_trigger(),
            });
        }

        ctx.stats.hits_mined.fetch_add(n_hits as u64, Ordering::Relaxed);
    }
}

impl DatagramProcessor for BbbProcessor {
    fn header_size(&self) -> usize {
        bbb::OPT_HEADER_SIZE
    }

    fn hit_size(&self) -> usize {
        bbb::HIT_SIZE
    }

    fn tolerate_seq_drops(&self) -> bool {
        // BBB hubs wrap their sequence counter back to zero.
        true
    }

    fn process(&mut self, datagram: &[u8], n_hits: usize, do_mine: bool, ctx: &mut ReceiverContext) {
        let header = BbbOptHeader::decode(datagram);

        if header.common.packet_type != bbb::PACKET_TYPE_OPTICAL {
            if ctx.report_bad_datagram() {
                log::warn!(
                    "[BBBHitReceiver:{}] received non-optical packet (expected type {}, got {})",
                    self.port,
                    bbb::PACKET_TYPE_OPTICAL,
                    header.common.packet_type
                );
            }
            return;
        }

        if header.hit_count as usize != n_hits {
            if ctx.report_bad_datagram() {
                log::warn!(
                    "[BBBHitReceiver:{}] observed inconsistent hit counts (datagram reports {} hits but contains {})",
                    self.port,
                    header.hit_count,
                    n_hits
                );
            }
            return;
        }

        let base_time = header.common.window_start.to_tai();
        let window_end =
            base_time.add_nanos(u64::from(header.common.window_size) * bbb::TICK_NANOS);
        let plane_number = u32::from(header.common.plane_number);

        let outcome = ctx.sequence.check_and_increment(
            plane_number,
            header.common.seq_number,
            base_time,
            window_end,
        );
        if !ctx.apply_seq_outcome(plane_number, outcome) {
            // Late datagram, discard it.
            return;
        }

        // Peek at the first hit so the data clock reflects real hit time.
        let first_hit_time = if n_hits > 0 {
            BbbHit::decode(&datagram[bbb::OPT_HEADER_SIZE..bbb::OPT_HEADER_SIZE + bbb::HIT_SIZE])
                .time(base_time)
        } else {
            base_time
        };
        ctx.report_good_datagram(first_hit_time);

        if do_mine {
            self.mine_hits(datagram, n_hits, base_time, plane_number, ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{ReceiverStats, SequenceTracker};
    use crate::spill::{Spill, SpillSchedule};
    use crate::wire::bbb::{encode_datagram, BbbCommonHeader, BbbWindowStart};
    use std::sync::Arc;

    fn optical_header(seq: u32, hit_count: u32) -> BbbOptHeader {
        BbbOptHeader {
            common: BbbCommonHeader {
                packet_type: bbb::PACKET_TYPE_OPTICAL,
                plane_number: 300,
                run_number: 1,
                seq_number: seq,
                // 100 s into 1970 keeps the numbers readable.
                window_start: BbbWindowStart { year: 1970, ticks_since_year: 10_000_000_000 },
                window_size: 100_000,
            },
            window_flags: 0,
            hit_count,
        }
    }

    fn hits() -> Vec<BbbHit> {
        vec![
            BbbHit { channel_and_flags: 2, timestamp: 10, tot: 300, adc0: 7 },
            BbbHit { channel_and_flags: bbb::HIT_CPU_TRIGGER_FLAG | 5, timestamp: 50, tot: 20, adc0: 900 },
        ]
    }

    struct Fixture {
        schedule: Arc<SpillSchedule>,
        stats: ReceiverStats,
        sequence: SequenceTracker,
        spill: Arc<Spill>,
    }

    impl Fixture {
        fn new() -> Self {
            let schedule = Arc::new(SpillSchedule::new());
            let mut spill = Spill::created(TaiTimestamp::new(0, 0), TaiTimestamp::max_time());
            spill.allocate_for_test(0, 1);
            let spill = Arc::new(spill);
            schedule.install_for_test(Arc::clone(&spill));
            Self {
                schedule,
                stats: ReceiverStats::default(),
                sequence: SequenceTracker::new(true),
                spill,
            }
        }

        fn feed(&mut self, datagram: &[u8], n_hits: usize, do_mine: bool) {
            let mut ctx = ReceiverContext {
                schedule: &self.schedule,
                data_slot_idx: 0,
                stats: &self.stats,
                sequence: &mut self.sequence,
                port: 57101,
            };
            BbbProcessor::new(57101).process(datagram, n_hits, do_mine, &mut ctx);
        }
    }

    #[test]
    fn test_mines_hits_with_ten_ns_offsets() {
        let mut fx = Fixture::new();
        let wire = encode_datagram(&optical_header(0, 2), &hits());
        fx.feed(&wire, 2, true);

        assert_eq!(fx.stats.snapshot().hits_mined, 2);
        let queues = fx.spill.slot(0).take_queues();
        let (plane, queue) = queues.iter().next().expect("one plane");
        assert_eq!(*plane, 300);
        // Window start = 100 s; offsets 10 and 50 ticks = 100 and 500 ns.
        assert_eq!(queue[0].timestamp, TaiTimestamp::new(100, 100));
        assert_eq!(queue[1].timestamp, TaiTimestamp::new(100, 500));
        assert_eq!(queue[0].channel_number, 2);
        assert_eq!(queue[0].tot, u8::MAX); // saturated from 300
        assert_eq!(queue[0].adc0, 7);
        assert!(queue[1].cpu_trigger);
    }

    #[test]
    fn test_inconsistent_hit_count_is_bad() {
        let mut fx = Fixture::new();
        // Header claims 3 hits, body carries 2.
        let wire = encode_datagram(&optical_header(0, 3), &hits());
        fx.feed(&wire, 2, true);

        let stats = fx.stats.snapshot();
        assert_eq!(stats.bad_datagrams, 1);
        assert_eq!(stats.hits_mined, 0);
    }

    #[test]
    fn test_wrap_to_zero_is_accepted() {
        let mut fx = Fixture::new();
        for seq in [7, 8, 0] {
            let wire = encode_datagram(&optical_header(seq, 2), &hits());
            fx.feed(&wire, 2, true);
        }

        let stats = fx.stats.snapshot();
        assert_eq!(stats.late_datagrams, 0);
        assert_eq!(stats.gaps_reported, 0);
        assert_eq!(stats.hits_mined, 6);
        assert_eq!(stats.datagrams_received, 3);
    }

    #[test]
    fn test_data_clock_follows_first_hit() {
        let mut fx = Fixture::new();
        let wire = encode_datagram(&optical_header(0, 2), &hits());
        fx.feed(&wire, 2, false);
        assert_eq!(
            fx.schedule.last_approx_timestamp(),
            TaiTimestamp::new(100, 100)
        );
    }

    #[test]
    fn test_empty_window_uses_window_start() {
        let mut fx = Fixture::new();
        let wire = encode_datagram(&optical_header(0, 0), &[]);
        fx.feed(&wire, 0, false);
        assert_eq!(
            fx.schedule.last_approx_timestamp(),
            TaiTimestamp::new(100, 0)
        );
    }
}
