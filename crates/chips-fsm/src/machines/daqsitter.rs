// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Daqsitter participant machine.

use crate::events::DaqsitterEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqsitterState {
    Offline,
    Unknown,
    Ready,
    Started,
}

impl DaqsitterState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Offline => "Offline",
            Self::Unknown => "Unknown",
            Self::Ready => "Ready",
            Self::Started => "Started",
        }
    }

    pub fn react(self, event: DaqsitterEvent) -> Option<Self> {
        match (self, event) {
            (state, DaqsitterEvent::Disconnected) if state != Self::Offline => Some(Self::Offline),
            (Self::Offline, DaqsitterEvent::Connected) => Some(Self::Unknown),
            (Self::Unknown, DaqsitterEvent::Ready) => Some(Self::Ready),
            (Self::Unknown, DaqsitterEvent::Started) => Some(Self::Started),
            (Self::Ready, DaqsitterEvent::Started) => Some(Self::Started),
            (Self::Started, DaqsitterEvent::Ready) => Some(Self::Ready),
            _ => None,
        }
    }
}
