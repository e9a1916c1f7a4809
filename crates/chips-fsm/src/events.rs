// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Events dispatched through the supervisor.

use chips_daq::run::RunType;

/// Everything the five sub-machines can react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Some machine changed state; dependents re-evaluate.
    StateUpdate,
    /// Operator interrupt (SIGINT).
    KillSignal,
    /// Operator command from the uplink.
    Ops(OpsEvent),
    /// Control-bus link status.
    ControlBus(LinkEvent),
    /// Daqonite state-bus observation.
    Daqonite(DaqoniteEvent),
    /// Daqontrol state-bus observation.
    Daqontrol(DaqontrolEvent),
    /// Daqsitter state-bus observation.
    Daqsitter(DaqsitterEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpsEvent {
    Config { path: String },
    StartData,
    StopData,
    StartRun { run_type: RunType },
    StopRun,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqoniteEvent {
    Connected,
    Disconnected,
    Ready,
    Running(RunType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqontrolEvent {
    Connected,
    Disconnected,
    Initialising,
    Ready,
    Configured,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqsitterEvent {
    Connected,
    Disconnected,
    Ready,
    Started,
}
