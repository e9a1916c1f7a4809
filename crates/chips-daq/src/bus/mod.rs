// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! The control bus.
//!
//! Four pub/sub topics (control commands plus one state topic per
//! participant) and one request/reply endpoint for the operator uplink.
//! Message layouts live in [`msg`], transports in [`socket`]; the
//! [`publisher`] and [`receiver`] loops wrap them for participants.
//! Endpoint defaults live in [`crate::config`] and every address is
//! configurable.

pub mod msg;
pub mod publisher;
pub mod receiver;
pub mod socket;

pub use msg::{
    ControlMessage, DaqoniteStateMessage, DaqontrolStateMessage, DaqsitterStateMessage,
    DecodeError, OpsMessage,
};
pub use publisher::{BusPublisher, StateSource};
pub use receiver::{CommandHandler, CommandReceiver};
pub use socket::{is_timeout, BusUrl, InvalidBusUrl, PubSocket, RepSocket, ReqSocket, SubSocket};
