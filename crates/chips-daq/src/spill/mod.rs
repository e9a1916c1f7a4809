// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Spills and the spill schedule.
//!
//! A [`Spill`] is a half-open TAI interval with one [`SpillDataSlot`] per
//! registered receiver. The [`SpillSchedule`] owns the list of currently
//! open spills behind a reader-preferring shared lock: receive threads read
//! it on every datagram, the scheduling thread rewrites it twice a second.
//!
//! A spill moves monotonically through
//! `created -> open -> closed-for-writing -> serialised -> dropped`.

use crate::config;
use crate::hit::SpillDataSlot;
use crate::scheduler::SpillScheduler;
use crate::serialise::RunSerialiser;
use crate::time::{TaiTimestamp, UtcTimestamp};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// One scheduled time bucket of data.
#[derive(Debug)]
pub struct Spill {
    /// Monotonically assigned at schedule time.
    spill_number: u64,
    /// Interval `[start_time, end_time)`.
    start_time: TaiTimestamp,
    end_time: TaiTimestamp,
    /// Set by the scheduler variant, cleared once slots are allocated.
    created: bool,
    /// True after the first successful write.
    started: AtomicBool,
    /// Wall clock of the most recent write, as nanoseconds since the UTC
    /// epoch. Used only for close detection.
    last_updated: AtomicU64,
    /// One slot per receiver, allocated at scheduling time.
    slots: Vec<SpillDataSlot>,
}

impl Spill {
    /// A freshly created spill, before slot allocation.
    pub fn created(start_time: TaiTimestamp, end_time: TaiTimestamp) -> Self {
        debug_assert!(start_time < end_time);
        Self {
            spill_number: 0,
            start_time,
            end_time,
            created: true,
            started: AtomicBool::new(false),
            last_updated: AtomicU64::new(0),
            slots: Vec::new(),
        }
    }

    pub fn spill_number(&self) -> u64 {
        self.spill_number
    }

    pub fn start_time(&self) -> TaiTimestamp {
        self.start_time
    }

    pub fn end_time(&self) -> TaiTimestamp {
        self.end_time
    }

    pub fn contains(&self, timestamp: TaiTimestamp) -> bool {
        timestamp >= self.start_time && timestamp < self.end_time
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn slot(&self, data_slot_idx: usize) -> &SpillDataSlot {
        &self.slots[data_slot_idx]
    }

    pub fn slots(&self) -> &[SpillDataSlot] {
        &self.slots
    }

    /// Record a write touch: flips `started` and refreshes the close-out
    /// clock.
    fn touch(&self) {
        self.started.store(true, Ordering::Release);
        self.last_updated
            .store(UtcTimestamp::now().as_nanos(), Ordering::Release);
    }

    /// Test-only shortcut past the scheduling thread: number the spill and
    /// allocate its slots directly.
    #[cfg(test)]
    pub(crate) fn allocate_for_test(&mut self, spill_number: u64, n_slots: usize) {
        self.created = false;
        self.spill_number = spill_number;
        self.slots = (0..n_slots).map(|_| SpillDataSlot::new()).collect();
    }

    fn last_updated(&self) -> UtcTimestamp {
        UtcTimestamp::from_nanos(self.last_updated.load(Ordering::Acquire))
    }

    /// Raise every slot's closed flag, then cycle every slot mutex so no
    /// writer is still mid-append when this returns.
    fn close_all_slots(&self) {
        for slot in &self.slots {
            slot.close_for_writing();
        }
        for slot in &self.slots {
            slot.wait_for_writers();
        }
    }
}

type SpillList = Vec<Arc<Spill>>;

/// The list of currently open spills and its scheduling thread.
pub struct SpillSchedule {
    current_schedule: RwLock<SpillList>,
    /// Monotonic high-water mark of observed data time; schedulers
    /// extrapolate forward from it.
    last_approx_timestamp: Mutex<TaiTimestamp>,
    /// Number of data slots handed out. Constant during runs.
    n_slots: AtomicUsize,
    /// Spills shed because the serialiser FIFO was full.
    spills_shed: AtomicU64,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SpillSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl SpillSchedule {
    pub fn new() -> Self {
        Self {
            current_schedule: RwLock::new(Vec::new()),
            last_approx_timestamp: Mutex::new(TaiTimestamp::default()),
            n_slots: AtomicUsize::new(0),
            spills_shed: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Register a new data slot and return its stable index. Must not be
    /// called once scheduling has begun.
    pub fn assign_new_slot(&self) -> usize {
        assert!(
            !self.running.load(Ordering::Acquire),
            "data slots cannot be assigned while a run is scheduling"
        );
        self.n_slots.fetch_add(1, Ordering::AcqRel)
    }

    pub fn n_slots(&self) -> usize {
        self.n_slots.load(Ordering::Acquire)
    }

    /// Locate the open spill covering `timestamp` and mark it touched.
    ///
    /// Called from receive threads; takes the schedule's read side only.
    /// The caller locks the slot at `data_slot_idx` through
    /// [`SpillDataSlot::lock_for_writing`], which re-checks the closed flag
    /// under the slot mutex.
    pub fn find_open_spill(&self, timestamp: TaiTimestamp) -> Option<Arc<Spill>> {
        let schedule = self.current_schedule.read();
        for spill in schedule.iter() {
            if spill.contains(timestamp) {
                spill.touch();
                return Some(Arc::clone(spill));
            }
        }
        None
    }

    /// Bump up the last approximate timestamp. Only ever advances.
    pub fn update_last_approx_timestamp(&self, timestamp: TaiTimestamp) {
        let mut last = self.last_approx_timestamp.lock();
        if timestamp > *last {
            *last = timestamp;
        }
    }

    pub fn last_approx_timestamp(&self) -> TaiTimestamp {
        *self.last_approx_timestamp.lock()
    }

    /// Number of spills currently open. Test and monitoring helper.
    pub fn n_open_spills(&self) -> usize {
        self.current_schedule.read().len()
    }

    /// Publish an externally built spill, bypassing the scheduling thread.
    #[cfg(test)]
    pub(crate) fn install_for_test(&self, spill: Arc<Spill>) {
        self.current_schedule.write().push(spill);
    }

    /// Start scheduling for a run: reset state and spawn the scheduling
    /// thread.
    pub fn start_run(
        self: Arc<Self>,
        scheduler: Arc<dyn SpillScheduler>,
        serialiser: Arc<RunSerialiser>,
    ) {
        {
            let mut schedule = self.current_schedule.write();
            schedule.clear();
        }
        *self.last_approx_timestamp.lock() = TaiTimestamp::default();

        self.running.store(true, Ordering::Release);
        let this = Arc::clone(&self);
        let handle = std::thread::Builder::new()
            .name("chips-scheduling".into())
            .spawn(move || this.scheduling_loop(&scheduler, &serialiser))
            .expect("failed to spawn scheduling thread");
        *self.worker.lock() = Some(handle);
    }

    /// Stop the scheduling thread and wait until every remaining spill is
    /// closed out.
    pub fn stop_run(&self) {
        log::debug!("[SpillSchedule] joining scheduling thread");
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("[SpillSchedule] scheduling thread panicked");
            }
        }
        log::debug!("[SpillSchedule] scheduling thread joined");
    }

    fn scheduling_loop(&self, scheduler: &Arc<dyn SpillScheduler>, serialiser: &Arc<RunSerialiser>) {
        log::info!("[SpillSchedule] scheduling thread up and running");
        scheduler.begin_scheduling();

        let maturation_secs = config::maturation_secs_from_env();
        let mut n_spills: u64 = 0;

        while self.running.load(Ordering::Acquire) {
            {
                let lock = self.current_schedule.upgradable_read();

                // Work on a copy; open spills are shared through their Arcs.
                let mut new_schedule: SpillList = lock.clone();

                self.close_old_spills(&mut new_schedule, maturation_secs, serialiser);

                scheduler.update_schedule(&mut new_schedule, self.last_approx_timestamp());
                self.prepare_new_spills(&mut new_schedule, &mut n_spills);

                let mut lock = RwLockUpgradableReadGuard::upgrade(lock);
                *lock = new_schedule;
            }

            std::thread::sleep(config::SCHEDULE_CADENCE);
        }

        // Close remaining spills, empty or not.
        let mut remaining = {
            let mut lock = self.current_schedule.write();
            std::mem::take(&mut *lock)
        };
        for spill in remaining.drain(..) {
            self.close_spill(spill, serialiser);
        }

        scheduler.end_scheduling();
        log::info!("[SpillSchedule] scheduling thread signing off");
    }

    /// Close every started spill that has not been written to for the
    /// maturation period.
    fn close_old_spills(
        &self,
        schedule: &mut SpillList,
        maturation_secs: u64,
        serialiser: &Arc<RunSerialiser>,
    ) {
        let now = UtcTimestamp::now();
        let close_time = UtcTimestamp::new(now.secs.saturating_sub(maturation_secs), now.nanosecs);

        schedule.retain(|spill| {
            if spill.is_started() && spill.last_updated() < close_time {
                self.close_spill(Arc::clone(spill), serialiser);
                false
            } else {
                true
            }
        });
    }

    /// Close one spill: bar further writes, then discard or hand to the
    /// serialiser.
    fn close_spill(&self, spill: Arc<Spill>, serialiser: &Arc<RunSerialiser>) {
        spill.close_all_slots();

        // At this point no thread is writing into any of the slots.

        if !spill.is_started() {
            log::info!(
                "[SpillSchedule] spill {} discarded (not started at the time of closing)",
                spill.spill_number()
            );
            return;
        }

        log::info!(
            "[SpillSchedule] closing spill {} for processing",
            spill.spill_number()
        );
        if !serialiser.serialise_spill(Arc::clone(&spill)) {
            self.spills_shed.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[SpillSchedule] spill {} dropped because the serialiser queue is full",
                spill.spill_number()
            );
        }
    }

    /// Spills shed at the serialiser FIFO since construction.
    pub fn spills_shed(&self) -> u64 {
        self.spills_shed.load(Ordering::Relaxed)
    }

    /// Assign numbers and allocate slot arrays for spills the scheduler
    /// just created. Fresh spills are still exclusively owned here, so the
    /// cold fields can be written directly; published spills are skipped.
    fn prepare_new_spills(&self, schedule: &mut SpillList, n_spills: &mut u64) {
        let n_slots = self.n_slots();
        for entry in schedule.iter_mut() {
            let Some(spill) = Arc::get_mut(entry) else {
                continue;
            };
            if !spill.created {
                continue;
            }

            spill.created = false;
            spill.spill_number = *n_spills;
            *n_spills += 1;
            spill.started.store(false, Ordering::Release);
            spill
                .last_updated
                .store(UtcTimestamp::now().as_nanos(), Ordering::Release);
            spill.slots = (0..n_slots).map(|_| SpillDataSlot::new()).collect();

            log::info!(
                "[SpillSchedule] scheduling spill {} with time interval [{}, {})",
                spill.spill_number,
                spill.start_time,
                spill.end_time
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spill_interval_is_half_open() {
        let spill = Spill::created(TaiTimestamp::new(10, 0), TaiTimestamp::new(20, 0));
        assert!(spill.contains(TaiTimestamp::new(10, 0)));
        assert!(spill.contains(TaiTimestamp::new(19, 999_999_999)));
        assert!(!spill.contains(TaiTimestamp::new(20, 0)));
        assert!(!spill.contains(TaiTimestamp::new(9, 999_999_999)));
    }

    #[test]
    fn test_last_approx_timestamp_is_monotonic() {
        let schedule = SpillSchedule::new();
        schedule.update_last_approx_timestamp(TaiTimestamp::new(5, 0));
        schedule.update_last_approx_timestamp(TaiTimestamp::new(3, 0));
        assert_eq!(schedule.last_approx_timestamp(), TaiTimestamp::new(5, 0));
        schedule.update_last_approx_timestamp(TaiTimestamp::new(5, 1));
        assert_eq!(schedule.last_approx_timestamp(), TaiTimestamp::new(5, 1));
    }

    #[test]
    fn test_slot_indices_are_stable_and_distinct() {
        let schedule = SpillSchedule::new();
        assert_eq!(schedule.assign_new_slot(), 0);
        assert_eq!(schedule.assign_new_slot(), 1);
        assert_eq!(schedule.assign_new_slot(), 2);
        assert_eq!(schedule.n_slots(), 3);
    }

    #[test]
    fn test_find_open_spill_marks_started() {
        let schedule = SpillSchedule::new();
        schedule.assign_new_slot();

        let mut spill = Spill::created(TaiTimestamp::new(0, 0), TaiTimestamp::max_time());
        spill.created = false;
        spill.slots = vec![SpillDataSlot::new()];
        schedule.current_schedule.write().push(Arc::new(spill));

        assert!(schedule
            .find_open_spill(TaiTimestamp::max_time())
            .is_none());

        let found = schedule
            .find_open_spill(TaiTimestamp::new(100, 0))
            .expect("timestamp inside the open spill");
        assert!(found.is_started());
        assert!(found.last_updated().secs > 0);
    }
}
