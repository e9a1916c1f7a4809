// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Hit storage.
//!
//! One [`Hit`] per PMT pulse, appended by the receivers into the
//! [`SpillDataSlot`] matching the datagram's timestamp. Slots isolate
//! receivers from each other within a spill, so the only contention on the
//! hot path is the slot's own mutex against the closer.

use crate::time::TaiTimestamp;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// One photomultiplier pulse.
///
/// Hits are ordered by timestamp; per-plane queues are almost sorted on
/// arrival (datagram windows arrive in order, only intra-window offsets
/// interleave) which the serialiser's insertion sort exploits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    /// Globally unique module ID.
    pub plane_number: u32,
    /// PMT within the module: 0..15 (BBB) or 0..29 (CLB).
    pub channel_number: u8,
    /// TAI time of the hit, normalised.
    pub timestamp: TaiTimestamp,
    /// Time over threshold.
    pub tot: u8,
    /// Monitoring ADC sample; [`Hit::NO_ADC0`] when the stream carries none.
    pub adc0: u8,
    /// Set when the BBB hub flagged the hit as CPU-triggered.
    pub cpu_trigger: bool,
}

impl Hit {
    /// Sentinel for streams without an ADC sample (CLB).
    pub const NO_ADC0: u8 = u8::MAX;

    /// The end-marker hit appended before merging; compares greater than
    /// every physical hit.
    pub(crate) fn end_marker() -> Self {
        Self {
            plane_number: 0,
            channel_number: 0,
            timestamp: TaiTimestamp::max_time(),
            tot: 0,
            adc0: 0,
            cpu_trigger: false,
        }
    }
}

impl Hit {
    /// True when `self` must come before `other` in time order. Hits are
    /// deliberately not `Ord`: equality compares every field, while the
    /// time order cares only about the timestamp.
    pub fn is_before(&self, other: &Self) -> bool {
        self.timestamp < other.timestamp
    }
}

/// Time-ordered sequence of hits of one plane within one spill.
///
/// Grows by appending; writers never re-order it. Sorted once by the
/// serialiser before merging.
pub type HitQueue = Vec<Hit>;

/// Per-plane hit queues of one slot (or one consolidated spill).
///
/// A `BTreeMap` keeps plane iteration deterministic, which the merge and
/// the tests rely on.
#[derive(Debug, Default)]
pub struct MultiPlaneHitQueue {
    queues: BTreeMap<u32, HitQueue>,
}

impl MultiPlaneHitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for `plane`, created on first use.
    pub fn queue_for_writing(&mut self, plane: u32) -> &mut HitQueue {
        self.queues.entry(plane).or_default()
    }

    /// Move every queue of `other` into `self`, splicing queues of planes
    /// present in both.
    pub fn absorb(&mut self, other: MultiPlaneHitQueue) {
        for (plane, mut queue) in other.queues {
            self.queues.entry(plane).or_default().append(&mut queue);
        }
    }

    pub fn n_planes(&self) -> usize {
        self.queues.len()
    }

    pub fn n_hits(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &HitQueue)> {
        self.queues.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut HitQueue)> {
        self.queues.iter_mut()
    }

    pub fn into_queues(self) -> BTreeMap<u32, HitQueue> {
        self.queues
    }
}

/// Per-receiver storage within one spill.
///
/// Writers take the mutex to append; the closer raises `closed_for_writing`
/// and then cycles the mutex as a barrier. Once the flag is up it is never
/// lowered, and no writer may append again.
#[derive(Debug, Default)]
pub struct SpillDataSlot {
    closed_for_writing: AtomicBool,
    queues: Mutex<MultiPlaneHitQueue>,
}

impl SpillDataSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock-free observation of the closed flag.
    pub fn is_closed_for_writing(&self) -> bool {
        self.closed_for_writing.load(Ordering::Acquire)
    }

    /// Acquire the slot for appending, re-checking the closed flag under
    /// the lock. Returns `None` once the spill is closed: the cheap check
    /// first, then the lock, then the re-check against a closer that raced
    /// between the two.
    pub fn lock_for_writing(&self) -> Option<MutexGuard<'_, MultiPlaneHitQueue>> {
        if self.is_closed_for_writing() {
            return None;
        }

        let guard = self.queues.lock();
        if self.is_closed_for_writing() {
            return None;
        }

        Some(guard)
    }

    /// Raise the closed flag. Writer threads observe it before and after
    /// taking the mutex.
    pub fn close_for_writing(&self) {
        self.closed_for_writing.store(true, Ordering::Release);
    }

    /// Lock and immediately unlock the slot. After the closed flag is up,
    /// this guarantees no writer is still mid-append (the mutex provides
    /// the release/acquire edge).
    pub fn wait_for_writers(&self) {
        drop(self.queues.lock());
    }

    /// Take the queues out of a closed slot for consolidation.
    pub fn take_queues(&self) -> MultiPlaneHitQueue {
        std::mem::take(&mut *self.queues.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(plane: u32, secs: u64, nanos: u32) -> Hit {
        Hit {
            plane_number: plane,
            channel_number: 0,
            timestamp: TaiTimestamp::new(secs, nanos),
            tot: 10,
            adc0: Hit::NO_ADC0,
            cpu_trigger: false,
        }
    }

    #[test]
    fn test_hit_ordering_by_timestamp() {
        let earlier = hit(9, 10, 100);
        let later = hit(1, 10, 200);
        assert!(earlier.is_before(&later));
        assert!(!later.is_before(&earlier));
        assert!(hit(1, 0, 0).is_before(&Hit::end_marker()));
    }

    #[test]
    fn test_multiqueue_splices_per_plane() {
        let mut first = MultiPlaneHitQueue::new();
        first.queue_for_writing(1).push(hit(1, 1, 0));
        first.queue_for_writing(2).push(hit(2, 1, 0));

        let mut second = MultiPlaneHitQueue::new();
        second.queue_for_writing(1).push(hit(1, 2, 0));

        first.absorb(second);
        assert_eq!(first.n_planes(), 2);
        assert_eq!(first.n_hits(), 3);
        let planes: Vec<u32> = first.iter().map(|(p, _)| *p).collect();
        assert_eq!(planes, vec![1, 2]);
    }

    #[test]
    fn test_slot_closed_flag_blocks_writers() {
        let slot = SpillDataSlot::new();

        {
            let mut guard = slot.lock_for_writing().expect("slot starts open");
            guard.queue_for_writing(5).push(hit(5, 1, 0));
        }

        slot.close_for_writing();
        slot.wait_for_writers();
        assert!(slot.lock_for_writing().is_none());

        let queues = slot.take_queues();
        assert_eq!(queues.n_hits(), 1);
    }

    #[test]
    fn test_closed_flag_visible_across_threads() {
        use std::sync::Arc;

        let slot = Arc::new(SpillDataSlot::new());
        let writer_slot = Arc::clone(&slot);

        let writer = std::thread::spawn(move || {
            let mut appended = 0u32;
            while let Some(mut guard) = writer_slot.lock_for_writing() {
                guard.queue_for_writing(1).push(hit(1, 0, appended));
                appended += 1;
            }
            appended
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        slot.close_for_writing();
        slot.wait_for_writers();

        let appended = writer.join().expect("writer thread");
        assert_eq!(slot.take_queues().n_hits() as u32, appended);
    }
}
