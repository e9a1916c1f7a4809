// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Spill interval schedulers.
//!
//! A scheduler variant maintains the spill schedule: a series of disjoint
//! time intervals to which taken data is matched. The scheduling thread
//! calls [`SpillScheduler::update_schedule`] twice a second to keep the
//! schedule ahead of incoming data.

mod tdu;

pub use tdu::{SpillSignalType, TduSpillScheduler, TriggerPredictor};

use crate::spill::Spill;
use crate::time::TaiTimestamp;
use std::sync::Arc;
use std::time::Duration;

/// Strategy producing spill intervals. Implementations must keep the
/// scheduled intervals disjoint.
pub trait SpillScheduler: Send + Sync {
    /// Called once when the scheduling thread starts.
    fn begin_scheduling(&self) {}

    /// Append spills to `schedule` so it stays ahead of `last_approx`, the
    /// most recent data timestamp observed by any receiver.
    fn update_schedule(&self, schedule: &mut Vec<Arc<Spill>>, last_approx: TaiTimestamp);

    /// Called once when the scheduling thread exits.
    fn end_scheduling(&self) {}
}

/// Scheduler which produces a single spill covering all of time. Used for
/// test runs without triggers.
#[derive(Debug, Default)]
pub struct InfiniteScheduler;

impl SpillScheduler for InfiniteScheduler {
    fn update_schedule(&self, schedule: &mut Vec<Arc<Spill>>, _last_approx: TaiTimestamp) {
        if schedule.is_empty() {
            schedule.push(Arc::new(Spill::created(
                TaiTimestamp::min_time(),
                TaiTimestamp::max_time(),
            )));
        }
    }
}

/// Scheduler which produces back-to-back spills of uniform duration.
#[derive(Debug)]
pub struct PeriodicScheduler {
    n_spills_ahead: usize,
    spill_duration: Duration,
}

impl PeriodicScheduler {
    pub fn new(n_spills_ahead: usize, spill_duration: Duration) -> Self {
        Self { n_spills_ahead, spill_duration }
    }
}

impl SpillScheduler for PeriodicScheduler {
    fn update_schedule(&self, schedule: &mut Vec<Arc<Spill>>, last_approx: TaiTimestamp) {
        if last_approx.is_empty() {
            // If there is no data, wait for more. Speculating here would
            // open spills no datagram can ever match.
            log::warn!("[PeriodicScheduler] no packets received, cannot schedule spills yet");
            return;
        }

        let duration_nanos = self.spill_duration.as_nanos() as u64;

        // The very first spill starts at the data high-water mark.
        if schedule.is_empty() {
            schedule.push(Arc::new(Spill::created(
                last_approx,
                last_approx.add_nanos(duration_nanos),
            )));
        }

        // From here on there is always a predecessor to butt against.
        while schedule.len() < self.n_spills_ahead {
            let start = schedule
                .last()
                .map(|spill| spill.end_time())
                .unwrap_or(last_approx);
            schedule.push(Arc::new(Spill::created(
                start,
                start.add_nanos(duration_nanos),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinite_scheduler_single_spill() {
        let scheduler = InfiniteScheduler;
        let mut schedule = Vec::new();

        scheduler.update_schedule(&mut schedule, TaiTimestamp::default());
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].start_time(), TaiTimestamp::min_time());
        assert_eq!(schedule[0].end_time(), TaiTimestamp::max_time());

        // Idempotent: the single spill is never duplicated.
        scheduler.update_schedule(&mut schedule, TaiTimestamp::new(5, 0));
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn test_periodic_scheduler_waits_for_data() {
        let scheduler = PeriodicScheduler::new(4, Duration::from_millis(100));
        let mut schedule = Vec::new();
        scheduler.update_schedule(&mut schedule, TaiTimestamp::default());
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_periodic_scheduler_butts_intervals() {
        let scheduler = PeriodicScheduler::new(4, Duration::from_millis(100));
        let mut schedule = Vec::new();
        scheduler.update_schedule(&mut schedule, TaiTimestamp::new(100, 0));

        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule[0].start_time(), TaiTimestamp::new(100, 0));
        for window in schedule.windows(2) {
            assert_eq!(window[0].end_time(), window[1].start_time());
        }
        assert_eq!(schedule[3].end_time(), TaiTimestamp::new(100, 400_000_000));
    }

    #[test]
    fn test_periodic_scheduler_tops_up_after_closure() {
        let scheduler = PeriodicScheduler::new(3, Duration::from_millis(100));
        let mut schedule = Vec::new();
        scheduler.update_schedule(&mut schedule, TaiTimestamp::new(100, 0));

        // A matured spill left the schedule; the next update appends after
        // the newest remaining interval.
        schedule.remove(0);
        scheduler.update_schedule(&mut schedule, TaiTimestamp::new(100, 150_000_000));
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule[0].start_time(), TaiTimestamp::new(100, 100_000_000));
        assert_eq!(schedule[2].end_time(), TaiTimestamp::new(100, 400_000_000));
    }
}
