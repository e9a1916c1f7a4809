// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Spill serialisation.
//!
//! The closer hands started spills to [`RunSerialiser`] through a bounded
//! lock-free FIFO; the serialiser thread consolidates each spill's slots,
//! sorts every per-plane queue, k-way merges them and appends the result
//! to the run file. The FIFO sheds rather than stalls: a full queue drops
//! the spill so the receive path never blocks on disk.

mod sorter;

pub use sorter::MergeSorter;

use crate::config;
use crate::hit::{HitQueue, MultiPlaneHitQueue};
use crate::run::{DataRun, RunFile};
use crate::spill::Spill;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Serialiser counters, exposed for monitoring and tests.
#[derive(Debug, Default)]
pub struct SerialiserStats {
    /// Spills written to the run file.
    pub spills_written: AtomicU64,
    /// Spills dropped on write failure.
    pub spills_failed: AtomicU64,
    /// Hit rows written.
    pub hits_written: AtomicU64,
}

/// Consumes closed spills and writes them to the run file.
pub struct RunSerialiser {
    run: Arc<DataRun>,
    waiting_spills: ArrayQueue<Arc<Spill>>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: SerialiserStats,
}

impl RunSerialiser {
    /// Open the run's output thread. The returned serialiser accepts
    /// spills immediately.
    pub fn start(run: Arc<DataRun>) -> Arc<Self> {
        Self::start_with_capacity(run, config::serialiser_queue_capacity_from_env())
    }

    /// As [`RunSerialiser::start`] with an explicit FIFO capacity.
    pub fn start_with_capacity(run: Arc<DataRun>, queue_capacity: usize) -> Arc<Self> {
        let this = Arc::new(Self {
            run,
            waiting_spills: ArrayQueue::new(queue_capacity.max(1)),
            running: AtomicBool::new(true),
            worker: Mutex::new(None),
            stats: SerialiserStats::default(),
        });

        let worker = Arc::clone(&this);
        let handle = std::thread::Builder::new()
            .name("chips-serialiser".into())
            .spawn(move || worker.run_loop())
            .expect("failed to spawn serialiser thread");
        *this.worker.lock() = Some(handle);

        this
    }

    /// Enqueue a closed spill for writing. Returns false when the FIFO is
    /// full; the caller logs and sheds the spill.
    pub fn serialise_spill(&self, spill: Arc<Spill>) -> bool {
        self.waiting_spills.push(spill).is_ok()
    }

    /// Drain the FIFO and join the output thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("[RunSerialiser] output thread panicked");
            }
        }

        // Anything still queued arrived after the thread drained; by then
        // the schedule has stopped, so this is unexpected.
        while let Some(spill) = self.waiting_spills.pop() {
            log::warn!(
                "[RunSerialiser] spill {} found in queue after output thread terminated, discarding data",
                spill.spill_number()
            );
        }
    }

    pub fn stats(&self) -> &SerialiserStats {
        &self.stats
    }

    fn run_loop(&self) {
        log::debug!("[RunSerialiser] output thread up and running");

        let out_path = self.run.output_path().to_path_buf();
        log::info!(
            "[RunSerialiser] run {} will be saved at '{}'",
            self.run.log_description(),
            out_path.display()
        );

        let mut out_file = match RunFile::create(&out_path) {
            Ok(file) => file,
            Err(err) => {
                log::error!(
                    "[RunSerialiser] error opening '{}' for writing: {}",
                    out_path.display(),
                    err
                );
                return;
            }
        };

        let mut sorter = MergeSorter::new();
        let mut out_queue = HitQueue::new();

        loop {
            let current_spill = match self.waiting_spills.pop() {
                Some(spill) => spill,
                None if !self.running.load(Ordering::Acquire) => break,
                None => {
                    std::thread::sleep(config::SERIALISER_POLL_INTERVAL);
                    continue;
                }
            };

            self.process_spill(&current_spill, &mut sorter, &mut out_queue, &mut out_file);
        }

        if let Err(err) = out_file.write_run_parameters(&self.run) {
            log::error!("[RunSerialiser] error writing run parameters: {}", err);
        }
        if let Err(err) = out_file.close() {
            log::error!("[RunSerialiser] error closing run file: {}", err);
        }

        log::debug!("[RunSerialiser] output thread signing off");
    }

    fn process_spill(
        &self,
        spill: &Spill,
        sorter: &mut MergeSorter,
        out_queue: &mut HitQueue,
        out_file: &mut RunFile,
    ) {
        // Consolidate the per-slot multi-queues into a single instance.
        let mut events = MultiPlaneHitQueue::new();
        for slot in spill.slots() {
            events.absorb(slot.take_queues());
        }

        log::info!(
            "[RunSerialiser] processing spill {} (from {} planes)",
            spill.spill_number(),
            events.n_planes()
        );

        // Per-plane queues are almost sorted already (in-order datagrams,
        // disorder only from intra-window offsets), which insertion sort
        // handles in close to linear time.
        let mut n_hits = 0usize;
        for (plane, queue) in events.iter_mut() {
            n_hits += queue.len();
            let n_swaps = insert_sort(queue);
            log::info!(
                "[RunSerialiser] plane {} ({} hits) required {} swaps to achieve time ordering",
                plane,
                queue.len(),
                n_swaps
            );
        }

        out_queue.clear();
        if n_hits > 0 {
            log::info!("[RunSerialiser] merge-sorting {} hits", n_hits);
            sorter.merge(events, out_queue);
        }

        match out_file
            .write_spill(spill, out_queue)
            .and_then(|()| out_file.flush())
        {
            Ok(()) => {
                self.stats.spills_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .hits_written
                    .fetch_add(out_queue.len() as u64, Ordering::Relaxed);
                log::info!(
                    "[RunSerialiser] spill {} done and written",
                    spill.spill_number()
                );
            }
            Err(err) => {
                // The spill is lost but the thread stays up for the next.
                self.stats.spills_failed.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "[RunSerialiser] error writing spill {}: {}",
                    spill.spill_number(),
                    err
                );
            }
        }

        out_queue.clear();
    }
}

/// Conventional in-place insertion sort, counting swaps.
///
/// O(n^2) worst case, but O(n + k*n) for k-sorted sequences; hit queues
/// arrive almost sorted, so this usually just scans.
fn insert_sort(queue: &mut HitQueue) -> usize {
    let mut n_swaps = 0;
    for i in 1..queue.len() {
        let mut j = i;
        while j > 0 && queue[j].is_before(&queue[j - 1]) {
            queue.swap(j, j - 1);
            j -= 1;
            n_swaps += 1;
        }
    }
    n_swaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::Hit;
    use crate::run::{RunFileReader, RunType, SchedulerKind};
    use crate::time::TaiTimestamp;
    use std::time::Duration;

    fn hit(plane: u32, secs: u64, nanos: u32) -> Hit {
        Hit {
            plane_number: plane,
            channel_number: 0,
            timestamp: TaiTimestamp::new(secs, nanos),
            tot: 1,
            adc0: Hit::NO_ADC0,
            cpu_trigger: false,
        }
    }

    fn sorted_queue(hits: &[Hit]) -> bool {
        hits.windows(2).all(|pair| !pair[1].is_before(&pair[0]))
    }

    #[test]
    fn test_insert_sort_counts_swaps() {
        let mut queue = vec![hit(1, 0, 30), hit(1, 0, 10), hit(1, 0, 20)];
        let swaps = insert_sort(&mut queue);
        assert!(sorted_queue(&queue));
        assert_eq!(swaps, 2);

        let mut sorted = vec![hit(1, 0, 1), hit(1, 0, 2)];
        assert_eq!(insert_sort(&mut sorted), 0);
    }

    fn spill_with_hits(hits_per_plane: &[(u32, Vec<Hit>)]) -> Arc<Spill> {
        let mut spill = Spill::created(TaiTimestamp::new(0, 0), TaiTimestamp::max_time());
        // One slot is enough: the test writes through it like a receiver.
        spill.allocate_for_test(0, 1);
        {
            let slot = spill.slot(0);
            let mut guard = slot.lock_for_writing().expect("open slot");
            for (plane, hits) in hits_per_plane {
                guard.queue_for_writing(*plane).extend(hits.iter().copied());
            }
        }
        Arc::new(spill)
    }

    #[test]
    fn test_serialiser_writes_merged_spill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = Arc::new(DataRun::new(
            1,
            RunType::TestNormal,
            SchedulerKind::Infinite,
            dir.path(),
        ));
        run.start();

        let serialiser = RunSerialiser::start_with_capacity(Arc::clone(&run), 8);

        let spill = spill_with_hits(&[
            (1, vec![hit(1, 10, 500), hit(1, 10, 100)]),
            (2, vec![hit(2, 10, 300)]),
        ]);
        spill.slot(0).close_for_writing();
        assert!(serialiser.serialise_spill(spill));

        run.stop();
        serialiser.stop();

        let contents = RunFileReader::open(run.output_path())
            .expect("open run file")
            .read_all()
            .expect("read run file");

        assert_eq!(contents.spills.len(), 1);
        assert_eq!(contents.opt_hits.len(), 3);
        assert_eq!(contents.spills[0].opt_hits_begin, 0);
        assert_eq!(contents.spills[0].opt_hits_end, 3);
        let times: Vec<u32> = contents.opt_hits.iter().map(|h| h.tai_time.nanosecs).collect();
        assert_eq!(times, vec![100, 300, 500]);

        let params = contents.run_params.expect("run params");
        assert_eq!(params.number, 1);
        assert_eq!(params.run_type, RunType::TestNormal.code());
    }

    #[test]
    fn test_full_fifo_sheds_spills() {
        let dir = tempfile::tempdir().expect("tempdir");
        // The output directory does not exist, so the output thread exits
        // right after failing to create the file and nothing is drained.
        let run = Arc::new(DataRun::new(
            2,
            RunType::TestNormal,
            SchedulerKind::Infinite,
            &dir.path().join("missing"),
        ));

        let serialiser = RunSerialiser::start_with_capacity(Arc::clone(&run), 2);
        std::thread::sleep(Duration::from_millis(20));

        let accepted = (0..10)
            .filter(|_| serialiser.serialise_spill(spill_with_hits(&[(1, vec![hit(1, 1, 0)])])))
            .count();
        assert_eq!(accepted, 2);

        serialiser.stop();
    }

    #[test]
    fn test_serialiser_drains_queue_on_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = Arc::new(DataRun::new(
            3,
            RunType::TestNormal,
            SchedulerKind::Infinite,
            dir.path(),
        ));
        run.start();

        let serialiser = RunSerialiser::start_with_capacity(Arc::clone(&run), 16);
        for _ in 0..5 {
            assert!(serialiser.serialise_spill(spill_with_hits(&[(1, vec![hit(1, 1, 0)])])));
        }

        // No timeout on the final drain: all five spills get written.
        std::thread::sleep(Duration::from_millis(10));
        run.stop();
        serialiser.stop();

        assert_eq!(serialiser.stats().spills_written.load(Ordering::Relaxed), 5);

        let contents = RunFileReader::open(run.output_path())
            .expect("open")
            .read_all()
            .expect("read");
        assert_eq!(contents.spills.len(), 5);
    }
}
