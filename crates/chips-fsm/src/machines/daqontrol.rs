// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Daqontrol participant machine.

use crate::events::DaqontrolEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqontrolState {
    Offline,
    Unknown,
    Initialising,
    Ready,
    Configured,
    Started,
}

impl DaqontrolState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Offline => "Offline",
            Self::Unknown => "Unknown",
            Self::Initialising => "Initialising",
            Self::Ready => "Ready",
            Self::Configured => "Configured",
            Self::Started => "Started",
        }
    }

    pub fn react(self, event: DaqontrolEvent) -> Option<Self> {
        match (self, event) {
            (state, DaqontrolEvent::Disconnected) if state != Self::Offline => Some(Self::Offline),
            (Self::Offline, DaqontrolEvent::Connected) => Some(Self::Unknown),
            // Out of Unknown, any reported state is adopted.
            (Self::Unknown, DaqontrolEvent::Initialising) => Some(Self::Initialising),
            (Self::Unknown, DaqontrolEvent::Ready) => Some(Self::Ready),
            (Self::Unknown, DaqontrolEvent::Configured) => Some(Self::Configured),
            (Self::Unknown, DaqontrolEvent::Started) => Some(Self::Started),
            (Self::Initialising, DaqontrolEvent::Ready) => Some(Self::Ready),
            (Self::Ready, DaqontrolEvent::Configured) => Some(Self::Configured),
            (Self::Configured, DaqontrolEvent::Started) => Some(Self::Started),
            (Self::Started, DaqontrolEvent::Configured) => Some(Self::Configured),
            _ => None,
        }
    }
}
