// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Control-bus link machine.

use crate::events::LinkEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlBusState {
    Offline,
    Online,
}

impl ControlBusState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Offline => "Offline",
            Self::Online => "Online",
        }
    }

    /// The follow-up state, or `None` when the event changes nothing.
    pub fn react(self, event: LinkEvent) -> Option<Self> {
        match (self, event) {
            (Self::Offline, LinkEvent::Connected) => Some(Self::Online),
            (Self::Online, LinkEvent::Disconnected) => Some(Self::Offline),
            _ => None,
        }
    }
}
