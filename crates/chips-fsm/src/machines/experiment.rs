// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Experiment (supervisor) machine states. The transition logic lives on
//! the aggregate in [`crate::machines`], since it reads the sibling
//! machines.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentState {
    /// Waiting for all participants to come online.
    Init,
    /// Accepting operator commands.
    Ready,
    /// StartRun broadcast, waiting for Daqonite to observe Running.
    StartingRun,
    /// A run is in progress.
    Run,
    /// StopRun broadcast, waiting for Daqonite to return to Ready.
    StoppingRun,
    /// Terminal for anomalous participant states.
    Error,
    /// Terminal; the process shuts down.
    Exit,
}

impl ExperimentState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Ready => "Ready",
            Self::StartingRun => "StartingRun",
            Self::Run => "Run",
            Self::StoppingRun => "StoppingRun",
            Self::Error => "Error",
            Self::Exit => "Exit",
        }
    }
}
