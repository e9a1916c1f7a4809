// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! CLB optical stream processing.

use crate::hit::Hit;
use crate::receiver::{DatagramProcessor, ReceiverContext};
use crate::wire::clb::{self, ClbCommonHeader, ClbHit};
use std::sync::atomic::Ordering;

/// Datagram processor for the CLB optical format.
pub struct ClbProcessor {
    port: u16,
}

impl ClbProcessor {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl DatagramProcessor for ClbProcessor {
    fn header_size(&self) -> usize {
        clb::HEADER_SIZE
    }

    fn hit_size(&self) -> usize {
        clb::HIT_SIZE
    }

    fn tolerate_seq_drops(&self) -> bool {
        // CLBs never legitimately rewind their sequence counter.
        false
    }

    fn process(&mut self, datagram: &[u8], n_hits: usize, do_mine: bool, ctx: &mut ReceiverContext) {
        let header = ClbCommonHeader::decode(datagram);

        if !header.is_optical() {
            if ctx.report_bad_datagram() {
                log::warn!(
                    "[CLBHitReceiver:{}] received non-optical packet (expected type {:#010x}, got {:#010x} which is {})",
                    self.port,
                    clb::DATA_TYPE_OPTICAL,
                    header.data_type,
                    header.data_type_name()
                );
            }
            return;
        }

        let plane_number = header.plane_id;
        let datagram_start_time = header.window_start();

        // The CLB header carries no window size, so the window start also
        // bounds reported gaps.
        let outcome = ctx.sequence.check_and_increment(
            plane_number,
            header.seq_number,
            datagram_start_time,
            datagram_start_time,
        );
        if !ctx.apply_seq_outcome(plane_number, outcome) {
            // Late datagram, discard it.
            return;
        }

        ctx.report_good_datagram(datagram_start_time);

        if !do_mine {
            return;
        }

        let Some(spill) = ctx.schedule.find_open_spill(datagram_start_time) else {
            // Timestamp not matched to any open spill, discard datagram.
            ctx.stats.unmatched_datagrams.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let slot = spill.slot(ctx.data_slot_idx);
        let Some(mut queues) = slot.lock_for_writing() else {
            // The spill was closed but not yet removed from the schedule.
            ctx.stats.unmatched_datagrams.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let queue = queues.queue_for_writing(plane_number);
        queue.reserve(n_hits);
        for i in 0..n_hits {
            let at = clb::HEADER_SIZE + i * clb::HIT_SIZE;
            let wire_hit = ClbHit::decode(&datagram[at..at + clb::HIT_SIZE]);

            queue.push(Hit {
                plane_number,
                channel_number: wire_hit.channel,
                timestamp: datagram_start_time.add_nanos(u64::from(wire_hit.timestamp_ns)),
                tot: wire_hit.tot,
                adc0: Hit::NO_ADC0,
                cpu_trigger: false,
            });
        }

        ctx.stats.hits_mined.fetch_add(n_hits as u64, Ordering::Relaxed);
    }
}
