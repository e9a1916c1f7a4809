// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Per-port UDP hit receivers.
//!
//! One receiver per configured port, each with a dedicated IO thread
//! running a mio poll loop that drains the socket until it would block.
//! A receiver has three modes:
//!
//! - *Idle* - drop everything;
//! - *Receiving* - parse and validate but discard the hit payload (the
//!   process is alive but no run is active);
//! - *Mining* - parse, validate and deposit hits into the spill slot
//!   matching the datagram's timestamp.
//!
//! The wire-format specifics live in the CLB/BBB processors; this module
//! owns the socket, the mode word, datagram validation, sequence tracking
//! and the per-receiver counters.

mod bbb;
mod clb;

pub use bbb::BbbProcessor;
pub use clb::ClbProcessor;

use crate::config;
use crate::spill::SpillSchedule;
use crate::time::TaiTimestamp;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Receiver processing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataMode {
    /// Drop everything.
    Idle = 0,
    /// Parse and validate, discard the payload.
    Receiving = 1,
    /// Parse, validate and deposit.
    Mining = 2,
}

impl DataMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Receiving,
            2 => Self::Mining,
            _ => Self::Idle,
        }
    }
}

/// Per-receiver counters.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    /// Well-formed optical datagrams accepted.
    pub datagrams_received: AtomicU64,
    /// Datagrams dropped by validation (size, type, late sequence).
    pub bad_datagrams: AtomicU64,
    /// Late (out-of-sequence) datagrams, also counted bad.
    pub late_datagrams: AtomicU64,
    /// Sequence gaps observed.
    pub gaps_reported: AtomicU64,
    /// Datagrams whose timestamp matched no open spill.
    pub unmatched_datagrams: AtomicU64,
    /// Hits deposited into spill slots.
    pub hits_mined: AtomicU64,
}

impl ReceiverStats {
    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bad_datagrams: self.bad_datagrams.load(Ordering::Relaxed),
            late_datagrams: self.late_datagrams.load(Ordering::Relaxed),
            gaps_reported: self.gaps_reported.load(Ordering::Relaxed),
            unmatched_datagrams: self.unmatched_datagrams.load(Ordering::Relaxed),
            hits_mined: self.hits_mined.load(Ordering::Relaxed),
        }
    }
}

/// One consistent read of [`ReceiverStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStatsSnapshot {
    pub datagrams_received: u64,
    pub bad_datagrams: u64,
    pub late_datagrams: u64,
    pub gaps_reported: u64,
    pub unmatched_datagrams: u64,
    pub hits_mined: u64,
}

/// Outcome of a sequence-number check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOutcome {
    /// The expected number, or the first datagram of a plane.
    InOrder,
    /// Datagrams were missed; the gap ends at this datagram's start.
    Gap { from: TaiTimestamp, to: TaiTimestamp },
    /// Sequence number below the expected one; drop the datagram.
    Late,
}

/// Per-plane `next expected sequence number` tracking.
///
/// Policy is per variant: CLB tolerates no drops at all, BBB tolerates a
/// drop to zero (counter wrap on the hub).
#[derive(Debug)]
pub struct SequenceTracker {
    next_expected: HashMap<u32, u32>,
    last_window_end: HashMap<u32, TaiTimestamp>,
    tolerate_drops_to_zero: bool,
}

impl SequenceTracker {
    pub fn new(tolerate_drops_to_zero: bool) -> Self {
        Self {
            next_expected: HashMap::new(),
            last_window_end: HashMap::new(),
            tolerate_drops_to_zero,
        }
    }

    /// Forget all planes. Done when data taking starts.
    pub fn reset(&mut self) {
        self.next_expected.clear();
        self.last_window_end.clear();
    }

    /// Check `seq` for `plane` and advance the expectation.
    ///
    /// `window_start`/`window_end` bound this datagram's time range and
    /// are used to report gap intervals (`window_end` may equal
    /// `window_start` when the format does not carry a window size).
    pub fn check_and_increment(
        &mut self,
        plane: u32,
        seq: u32,
        window_start: TaiTimestamp,
        window_end: TaiTimestamp,
    ) -> SeqOutcome {
        let next = *self.next_expected.entry(plane).or_insert(seq);

        if seq < next {
            let tolerated = self.tolerate_drops_to_zero && seq == 0;
            if !tolerated {
                return SeqOutcome::Late;
            }
        }

        let outcome = if seq > next {
            // Missed datagrams; not an error, take note and skip ahead.
            let from = self
                .last_window_end
                .get(&plane)
                .copied()
                .unwrap_or(window_start);
            SeqOutcome::Gap { from, to: window_start }
        } else {
            SeqOutcome::InOrder
        };

        self.next_expected.insert(plane, seq.wrapping_add(1));
        self.last_window_end.insert(plane, window_end.max(window_start));
        outcome
    }
}

/// What a processor needs from its surrounding receiver.
pub struct ReceiverContext<'a> {
    pub schedule: &'a Arc<SpillSchedule>,
    pub data_slot_idx: usize,
    pub stats: &'a ReceiverStats,
    pub sequence: &'a mut SequenceTracker,
    pub port: u16,
}

impl ReceiverContext<'_> {
    /// Count a datagram failing validation. True when this occurrence
    /// should be logged: the first few, then every thousandth, so a
    /// misbehaving sender cannot flood the log.
    pub fn report_bad_datagram(&self) -> bool {
        let n = self.stats.bad_datagrams.fetch_add(1, Ordering::Relaxed);
        n < 5 || n % 1000 == 0
    }

    /// Count an accepted datagram and advance the schedule's data clock.
    pub fn report_good_datagram(&self, start_time: TaiTimestamp) {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.schedule.update_last_approx_timestamp(start_time);
    }

    /// Apply a sequence-check outcome to the counters and log. Returns
    /// false when the datagram must be dropped.
    pub fn apply_seq_outcome(&self, plane: u32, outcome: SeqOutcome) -> bool {
        match outcome {
            SeqOutcome::InOrder => true,
            SeqOutcome::Gap { from, to } => {
                self.stats.gaps_reported.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[HitReceiver:{}] data stream gap on plane {}: [{}, {})",
                    self.port,
                    plane,
                    from,
                    to
                );
                true
            }
            SeqOutcome::Late => {
                self.stats.late_datagrams.fetch_add(1, Ordering::Relaxed);
                let _ = self.report_bad_datagram();
                false
            }
        }
    }
}

/// Variant-specific datagram handling.
pub trait DatagramProcessor: Send {
    /// Minimum datagram size.
    fn header_size(&self) -> usize;

    /// Size of one hit record; the body must be a whole number of these.
    fn hit_size(&self) -> usize;

    /// Whether a sequence drop to zero is tolerated.
    fn tolerate_seq_drops(&self) -> bool;

    /// Handle a size-validated datagram holding `n_hits` hit records.
    fn process(&mut self, datagram: &[u8], n_hits: usize, do_mine: bool, ctx: &mut ReceiverContext);
}

/// A per-port UDP endpoint feeding the spill schedule.
pub struct HitReceiver {
    port: u16,
    data_slot_idx: usize,
    mode: Arc<AtomicU8>,
    stats: Arc<ReceiverStats>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HitReceiver {
    /// Receiver for the CLB optical stream on `port`.
    pub fn clb(schedule: &Arc<SpillSchedule>, port: u16) -> io::Result<Self> {
        Self::spawn(schedule, port, Box::new(ClbProcessor::new(port)))
    }

    /// Receiver for the BBB optical stream on `port`.
    pub fn bbb(schedule: &Arc<SpillSchedule>, port: u16) -> io::Result<Self> {
        Self::spawn(schedule, port, Box::new(BbbProcessor::new(port)))
    }

    /// Bind the socket, register a data slot and start the IO thread in
    /// Idle mode.
    pub fn spawn(
        schedule: &Arc<SpillSchedule>,
        port: u16,
        processor: Box<dyn DatagramProcessor>,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if let Err(err) = socket.set_recv_buffer_size(config::receiver_os_buffer_from_env()) {
            // Not fatal: the kernel clamps to rmem_max anyway.
            log::warn!("[HitReceiver:{}] could not enlarge receive buffer: {}", port, err);
        }
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let bound_port = std_socket.local_addr()?.port();
        let mio_socket = mio::net::UdpSocket::from_std(std_socket);

        let data_slot_idx = schedule.assign_new_slot();
        let mode = Arc::new(AtomicU8::new(DataMode::Idle as u8));
        let stats = Arc::new(ReceiverStats::default());
        let running = Arc::new(AtomicBool::new(true));

        let thread = ReceiverThread {
            schedule: Arc::clone(schedule),
            socket: mio_socket,
            processor,
            port: bound_port,
            data_slot_idx,
            mode: Arc::clone(&mode),
            stats: Arc::clone(&stats),
            running: Arc::clone(&running),
        };
        let handle = std::thread::Builder::new()
            .name(format!("chips-hit-rx-{}", bound_port))
            .spawn(move || thread.run())?;

        log::info!("[HitReceiver:{}] bound, slot index {}", bound_port, data_slot_idx);

        Ok(Self {
            port: bound_port,
            data_slot_idx,
            mode,
            stats,
            running,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// The actual bound port (relevant when constructed with port 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn data_slot_idx(&self) -> usize {
        self.data_slot_idx
    }

    pub fn stats(&self) -> ReceiverStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn mode(&self) -> DataMode {
        DataMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Start consuming datagrams (without depositing hits).
    pub fn start_data(&self) {
        log::info!("[HitReceiver:{}] starting work on socket", self.port);
        self.set_mode(DataMode::Receiving);
    }

    /// Go back to dropping everything.
    pub fn stop_data(&self) {
        log::info!("[HitReceiver:{}] stopping work on socket", self.port);
        self.set_mode(DataMode::Idle);
    }

    /// Start depositing hits into the schedule.
    pub fn start_run(&self) {
        self.set_mode(DataMode::Mining);
    }

    /// Keep consuming but stop depositing.
    pub fn stop_run(&self) {
        self.set_mode(DataMode::Receiving);
    }

    fn set_mode(&self, mode: DataMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Stop the IO thread and close the socket.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HitReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ReceiverThread {
    schedule: Arc<SpillSchedule>,
    socket: mio::net::UdpSocket,
    processor: Box<dyn DatagramProcessor>,
    port: u16,
    data_slot_idx: usize,
    mode: Arc<AtomicU8>,
    stats: Arc<ReceiverStats>,
    running: Arc<AtomicBool>,
}

impl ReceiverThread {
    fn run(mut self) {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                log::error!("[HitReceiver:{}] failed to create poll: {}", self.port, err);
                return;
            }
        };
        let mut events = Events::with_capacity(4);

        const SOCKET_TOKEN: Token = Token(0);
        if let Err(err) =
            poll.registry()
                .register(&mut self.socket, SOCKET_TOKEN, Interest::READABLE)
        {
            log::error!("[HitReceiver:{}] failed to register socket: {}", self.port, err);
            return;
        }

        let mut buffer = vec![0u8; config::RECEIVER_DATAGRAM_BUFFER_BYTES];
        let mut sequence = SequenceTracker::new(self.processor.tolerate_seq_drops());
        let mut last_mode = DataMode::Idle;

        while self.running.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, Some(config::RECEIVER_POLL_TIMEOUT)) {
                if err.kind() != io::ErrorKind::Interrupted {
                    log::warn!("[HitReceiver:{}] poll error: {}", self.port, err);
                }
                continue;
            }

            let mode = DataMode::from_u8(self.mode.load(Ordering::Acquire));
            if mode != last_mode {
                if last_mode == DataMode::Idle {
                    // Fresh data-taking: sequence expectations restart.
                    sequence.reset();
                }
                last_mode = mode;
            }

            for event in events.iter() {
                if event.token() != SOCKET_TOKEN {
                    continue;
                }

                // Drain all available datagrams.
                loop {
                    let size = match self.socket.recv_from(&mut buffer) {
                        Ok((size, _source)) => size,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            // A single socket error never kills the
                            // receive loop.
                            log::warn!(
                                "[HitReceiver:{}] dropping datagram due to socket failure: {}",
                                self.port,
                                err
                            );
                            break;
                        }
                    };

                    match mode {
                        DataMode::Idle => {}
                        DataMode::Receiving => self.check_and_process(&buffer[..size], false, &mut sequence),
                        DataMode::Mining => self.check_and_process(&buffer[..size], true, &mut sequence),
                    }
                }
            }
        }

        log::debug!("[HitReceiver:{}] receive thread signing off", self.port);
    }

    /// Validate the datagram envelope, then let the variant processor at
    /// it.
    fn check_and_process(&mut self, datagram: &[u8], do_mine: bool, sequence: &mut SequenceTracker) {
        let header_size = self.processor.header_size();
        let hit_size = self.processor.hit_size();

        let mut ctx = ReceiverContext {
            schedule: &self.schedule,
            data_slot_idx: self.data_slot_idx,
            stats: &self.stats,
            sequence,
            port: self.port,
        };

        if datagram.len() < header_size {
            if ctx.report_bad_datagram() {
                log::warn!(
                    "[HitReceiver:{}] received datagram without header (expected at least {} bytes, got {})",
                    self.port,
                    header_size,
                    datagram.len()
                );
            }
            return;
        }

        let remaining = datagram.len() - header_size;
        if remaining % hit_size != 0 {
            if ctx.report_bad_datagram() {
                log::warn!(
                    "[HitReceiver:{}] received datagram with invalid body (expected multiple of {} bytes, got {} with remainder {})",
                    self.port,
                    hit_size,
                    remaining,
                    remaining % hit_size
                );
            }
            return;
        }

        self.processor
            .process(datagram, remaining / hit_size, do_mine, &mut ctx);
    }
}
