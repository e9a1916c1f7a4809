// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Spill sorting benchmarks.
//!
//! Measures the serialiser's hot path: per-plane insertion sorting of
//! almost-sorted queues, the k-way tournament merge, and CLB datagram
//! decoding.

use chips_daq::hit::{Hit, HitQueue, MultiPlaneHitQueue};
use chips_daq::serialise::MergeSorter;
use chips_daq::time::TaiTimestamp;
use chips_daq::wire::clb::{self, ClbCommonHeader, ClbHit};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn hit(plane: u32, nanos: u64) -> Hit {
    Hit {
        plane_number: plane,
        channel_number: (nanos % 30) as u8,
        timestamp: TaiTimestamp::new(100, 0).add_nanos(nanos),
        tot: 12,
        adc0: Hit::NO_ADC0,
        cpu_trigger: false,
    }
}

/// Queues the way datagrams produce them: globally ascending window
/// starts, locally shuffled intra-window offsets.
fn almost_sorted_queue(plane: u32, n_hits: usize) -> HitQueue {
    let mut queue = HitQueue::with_capacity(n_hits);
    let mut window_start = 0u64;
    while queue.len() < n_hits {
        for _ in 0..16.min(n_hits - queue.len()) {
            queue.push(hit(plane, window_start + fastrand::u64(0..1_000)));
        }
        window_start += 1_000;
    }
    queue
}

fn multi_queue(n_planes: u32, hits_per_plane: usize) -> MultiPlaneHitQueue {
    let mut queues = MultiPlaneHitQueue::new();
    for plane in 0..n_planes {
        *queues.queue_for_writing(plane) = almost_sorted_queue(plane, hits_per_plane);
    }
    queues
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for n_planes in [2u32, 8, 32] {
        let hits_per_plane = 4_096;
        group.throughput(Throughput::Elements(u64::from(n_planes) * hits_per_plane as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(n_planes),
            &n_planes,
            |b, &n_planes| {
                let mut sorter = MergeSorter::new();
                let mut output = HitQueue::new();
                b.iter_batched(
                    || {
                        let mut input = multi_queue(n_planes, hits_per_plane);
                        for (_plane, queue) in input.iter_mut() {
                            queue.sort_by_key(|hit| hit.timestamp);
                        }
                        input
                    },
                    |input| sorter.merge(black_box(input), &mut output),
                    criterion::BatchSize::LargeInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_insertion_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("insertion_sort");
    let n_hits = 16_384;
    group.throughput(Throughput::Elements(n_hits as u64));

    group.bench_function("almost_sorted", |b| {
        b.iter_batched(
            || almost_sorted_queue(0, n_hits),
            |mut queue| {
                // The sort the serialiser runs before merging.
                for i in 1..queue.len() {
                    let mut j = i;
                    while j > 0 && queue[j].is_before(&queue[j - 1]) {
                        queue.swap(j, j - 1);
                        j -= 1;
                    }
                }
                queue
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_clb_decode(c: &mut Criterion) {
    let header = ClbCommonHeader {
        data_type: clb::DATA_TYPE_OPTICAL,
        run_number: 1,
        seq_number: 0,
        timestamp_secs: 100,
        timestamp_ticks: 0,
        plane_id: 42,
        status: [0x8000_0000, 0, 0, 0],
    };
    let hits: Vec<ClbHit> = (0..200)
        .map(|i| ClbHit { channel: (i % 30) as u8, timestamp_ns: i * 371, tot: 9 })
        .collect();
    let wire = clb::encode_datagram(&header, &hits);

    let mut group = c.benchmark_group("clb_decode");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("datagram", |b| {
        b.iter(|| {
            let header = ClbCommonHeader::decode(black_box(&wire));
            let mut total = u64::from(header.plane_id);
            for i in 0..hits.len() {
                let at = clb::HEADER_SIZE + i * clb::HIT_SIZE;
                total += u64::from(ClbHit::decode(&wire[at..at + clb::HIT_SIZE]).timestamp_ns);
            }
            total
        });
    });
    group.finish();
}

criterion_group!(benches, bench_merge, bench_insertion_sort, bench_clb_decode);
criterion_main!(benches);
