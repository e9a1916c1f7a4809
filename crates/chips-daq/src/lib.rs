// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! # CHIPS DAQ - shore-side data acquisition for the CHIPS detector
//!
//! Core library of the CHIPS water-Cherenkov DAQ pipeline. Underwater planar
//! optical modules (POMs) stream timestamped photomultiplier hits over UDP to
//! the shore computer; this crate receives those streams on many ports in
//! parallel, buckets hits into accelerator-aligned time windows ("spills"),
//! time-sorts each closed spill across all planes and persists the result to
//! a per-run archival file, while the control bus drives the run lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                         Control plane                              |
//! |   ControlMessage bus  ->  CommandReceiver  ->  run lifecycle       |
//! |   BusPublisher  ->  participant state bus  ->  FSM supervisor      |
//! +--------------------------------------------------------------------+
//! |                         Data pipeline                              |
//! |   HitReceiver (per UDP port)  ->  SpillSchedule (open spills)      |
//! |       -> SpillDataSlot (per receiver, per spill)                   |
//! |       -> RunSerialiser (insertion sort + k-way merge)              |
//! |       -> RunFile (run_params / spills / opt_hits tables)           |
//! +--------------------------------------------------------------------+
//! |                         Wire formats                               |
//! |   CLB optical (big-endian)  |  BBB optical (native-endian)         |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`receiver::HitReceiver`] | Per-port UDP endpoint parsing optical datagrams |
//! | [`spill::SpillSchedule`] | The list of open spills and the scheduling thread |
//! | [`scheduler::SpillScheduler`] | Strategy producing spill intervals |
//! | [`serialise::RunSerialiser`] | Closes, merges and writes spills |
//! | [`run::RunFile`] | The per-run archival file |
//! | [`bus`] | Control/state message codecs and transports |

/// Control bus: message codecs, pub/sub transport, publisher and receiver.
pub mod bus;
/// Global configuration constants and `CHIPS_*` environment overrides.
pub mod config;
/// Hit storage: queues, multi-plane queues and per-receiver spill slots.
pub mod hit;
/// Per-port UDP hit receivers for the CLB and BBB streams.
pub mod receiver;
/// Data run lifecycle and the per-run archival file.
pub mod run;
/// Spill interval schedulers (infinite, periodic, externally triggered).
pub mod scheduler;
/// Spill closing, sorting, merging and persistence.
pub mod serialise;
/// Spills and the spill schedule.
pub mod spill;
/// TAI, UTC and NOvA timestamp types.
pub mod time;
/// UDP wire formats of the POM controller variants.
pub mod wire;

pub use hit::{Hit, HitQueue, MultiPlaneHitQueue, SpillDataSlot};
pub use run::{DataRun, RunType};
pub use spill::{Spill, SpillSchedule};
pub use time::{TaiTimestamp, UtcTimestamp};
