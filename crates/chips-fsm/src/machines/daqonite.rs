// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Daqonite participant machine.

use crate::events::DaqoniteEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqoniteState {
    Offline,
    Unknown,
    Ready,
    Running,
}

impl DaqoniteState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Offline => "Offline",
            Self::Unknown => "Unknown",
            Self::Ready => "Ready",
            Self::Running => "Running",
        }
    }

    pub fn react(self, event: DaqoniteEvent) -> Option<Self> {
        match (self, event) {
            (state, DaqoniteEvent::Disconnected) if state != Self::Offline => Some(Self::Offline),
            (Self::Offline, DaqoniteEvent::Connected) => Some(Self::Unknown),
            (Self::Unknown, DaqoniteEvent::Ready) => Some(Self::Ready),
            (Self::Unknown, DaqoniteEvent::Running(_)) => Some(Self::Running),
            (Self::Ready, DaqoniteEvent::Running(_)) => Some(Self::Running),
            (Self::Running, DaqoniteEvent::Ready) => Some(Self::Ready),
            _ => None,
        }
    }
}
