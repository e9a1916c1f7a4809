// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! CHIPS DAQ global configuration - single source of truth.
//!
//! This module centralizes the pipeline constants and their runtime
//! overrides. **Never hardcode elsewhere!**
//!
//! Two levels:
//!
//! - **Static**: compile-time constants (default ports, buffer sizes,
//!   scheduling cadence).
//! - **Environment**: `CHIPS_*` variables override selected constants at
//!   process start via the `*_from_env()` accessors.

use std::time::Duration;

// =======================================================================
// UDP data ports
// =======================================================================

/// Default port for the CLB optical data stream.
pub const CLB_OPTICAL_PORT: u16 = 56015;

/// Default port for the CLB monitoring stream.
///
/// Monitoring payloads are consumed by an external collaborator; the port
/// is reserved here so deployments keep the two streams apart.
pub const CLB_MONITORING_PORT: u16 = 56017;

/// First port of the default BBB optical range.
pub const BBB_OPTICAL_PORT_BASE: u16 = 57101;

// =======================================================================
// Receiver tuning
// =======================================================================

/// OS receive buffer requested for every optical socket (32 MiB).
///
/// Hit bursts arrive faster than the schedule lock can be cycled; the
/// kernel buffer absorbs them.
pub const RECEIVER_OS_BUFFER_BYTES: usize = 33_554_432;

/// Datagram reassembly buffer, larger than any valid optical datagram.
pub const RECEIVER_DATAGRAM_BUFFER_BYTES: usize = 65_536;

/// How long a receiver poll waits before re-checking its running flag.
pub const RECEIVER_POLL_TIMEOUT: Duration = Duration::from_millis(100);

// =======================================================================
// Spill scheduling
// =======================================================================

/// Cadence of the scheduling thread.
pub const SCHEDULE_CADENCE: Duration = Duration::from_millis(500);

/// Default maturation period: a started spill untouched for this long is
/// closed and handed to the serialiser.
pub const MATURATION_SECS: u64 = 4;

/// Default number of spills the periodic scheduler keeps ahead of data.
pub const SPILLS_AHEAD: usize = 8;

/// Default periodic spill duration.
pub const SPILL_DURATION: Duration = Duration::from_millis(100);

/// Trigger intervals remembered by the external-trigger predictor.
pub const TRIGGER_MEMORY_SIZE: usize = 32;

/// Half-width of the window centred on each predicted trigger.
pub const TRIGGER_WINDOW_RADIUS_SECS: f64 = 0.005;

/// Default port of the embedded external-trigger endpoint.
pub const TRIGGER_SERVER_PORT: u16 = 56060;

// =======================================================================
// Serialiser
// =======================================================================

/// Capacity of the bounded closed-spill FIFO. When full, further spills
/// are shed rather than stalling the closer.
pub const SERIALISER_QUEUE_CAPACITY: usize = 64;

/// How long the serialiser sleeps when its FIFO is empty.
pub const SERIALISER_POLL_INTERVAL: Duration = Duration::from_millis(200);

// =======================================================================
// Control bus endpoints
// =======================================================================

/// Operator uplink (request/reply).
pub const OPS_BUS_URL: &str = "udp://127.0.0.1:56070";

/// Control command bus (supervisor -> participants).
pub const CONTROL_BUS_URL: &str = "udp://239.255.86.1:56071";

/// Daqonite state bus.
pub const DAQONITE_BUS_URL: &str = "udp://239.255.86.1:56072";

/// Daqontrol state bus.
pub const DAQONTROL_BUS_URL: &str = "udp://239.255.86.1:56073";

/// Daqsitter state bus.
pub const DAQSITTER_BUS_URL: &str = "udp://239.255.86.1:56074";

/// Subscriber receive timeout; loops re-check their running flag at this
/// interval.
pub const BUS_RECV_TIMEOUT: Duration = Duration::from_millis(200);

/// Back-off before a bus endpoint is re-opened after a transport error.
pub const BUS_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Cadence of participant status publication.
pub const BUS_STATUS_INTERVAL: Duration = Duration::from_millis(200);

// =======================================================================
// Environment overrides
// =======================================================================

/// Maturation period, overridable with `CHIPS_MATURATION_SECS`.
pub fn maturation_secs_from_env() -> u64 {
    env_u64("CHIPS_MATURATION_SECS", MATURATION_SECS)
}

/// Serialiser FIFO capacity, overridable with `CHIPS_SERIALISER_QUEUE`.
pub fn serialiser_queue_capacity_from_env() -> usize {
    env_u64("CHIPS_SERIALISER_QUEUE", SERIALISER_QUEUE_CAPACITY as u64) as usize
}

/// OS receive buffer size, overridable with `CHIPS_RECV_BUFFER_BYTES`.
pub fn receiver_os_buffer_from_env() -> usize {
    env_u64("CHIPS_RECV_BUFFER_BYTES", RECEIVER_OS_BUFFER_BYTES as u64) as usize
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("[config] ignoring non-numeric {}={:?}", key, value);
                default
            }
        },
        Err(_) => default,
    }
}
