// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! K-way merge of per-plane hit queues.
//!
//! A balanced binary tournament: each round merges surviving queues in
//! pairs, so level `l` holds `ceil(N / 2^l)` queues and the work is
//! `O(total hits * log N)`. Every queue is terminated by an end-marker hit
//! that compares greater than any physical hit, so the inner merge loop
//! needs no bounds checks. Round buffers are recycled between spills
//! instead of recursing over owned allocations.

use crate::hit::{Hit, HitQueue, MultiPlaneHitQueue};

/// Reusable k-way merger.
#[derive(Debug, Default)]
pub struct MergeSorter {
    round: Vec<HitQueue>,
    next_round: Vec<HitQueue>,
    spare: Vec<HitQueue>,
}

impl MergeSorter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge every (individually sorted) per-plane queue of `input` into
    /// one time-ordered `output` sequence.
    pub fn merge(&mut self, input: MultiPlaneHitQueue, output: &mut HitQueue) {
        output.clear();

        let mut round = std::mem::take(&mut self.round);
        let mut next = std::mem::take(&mut self.next_round);
        round.clear();

        for (_plane, mut queue) in input.into_queues() {
            queue.push(Hit::end_marker());
            round.push(queue);
        }
        if round.is_empty() {
            self.round = round;
            self.next_round = next;
            return;
        }

        while round.len() > 1 {
            next.clear();

            let mut idx = 0;
            while idx + 1 < round.len() {
                let mut buffer = self.spare.pop().unwrap_or_default();
                Self::merge_pair(&round[idx], &round[idx + 1], &mut buffer);
                next.push(buffer);
                idx += 2;
            }
            if idx < round.len() {
                // Odd queue out; it advances to the next level untouched.
                next.push(std::mem::take(&mut round[idx]));
            }

            for mut consumed in round.drain(..) {
                consumed.clear();
                self.spare.push(consumed);
            }
            std::mem::swap(&mut round, &mut next);
        }

        let mut merged = round.pop().unwrap_or_default();
        let marker = merged.pop();
        debug_assert_eq!(marker.map(|hit| hit.timestamp), Some(Hit::end_marker().timestamp));
        std::mem::swap(output, &mut merged);

        merged.clear();
        self.spare.push(merged);
        self.round = round;
        self.next_round = next;
    }

    /// Linear merge of two sorted, marker-terminated queues into one
    /// marker-terminated queue.
    fn merge_pair(first: &HitQueue, second: &HitQueue, output: &mut HitQueue) {
        output.clear();

        // Correct for the end markers.
        let n = first.len() - 1 + second.len() - 1;
        output.reserve(n + 1);

        let mut i = 0;
        let mut j = 0;
        for _ in 0..n {
            if first[i].is_before(&second[j]) {
                output.push(first[i]);
                i += 1;
            } else {
                output.push(second[j]);
                j += 1;
            }
        }

        output.push(Hit::end_marker());
    }
}
