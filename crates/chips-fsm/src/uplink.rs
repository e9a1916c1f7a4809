// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Operator uplink.
//!
//! Request/reply endpoint for operator commands. Each request dispatches
//! the matching event, then the resulting Experiment state decides the
//! ack or nak sent back before the next request is received.

use crate::events::{Event, OpsEvent};
use crate::global::Global;
use crate::machines::ExperimentState;
use chips_daq::bus::{is_timeout, BusUrl, OpsMessage, RepSocket};
use chips_daq::config;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const ACK: [u8; 1] = [1];
const NAK: [u8; 1] = [0];

pub struct OpsUplink {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OpsUplink {
    pub fn start(url: BusUrl, global: Arc<Global>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("chips-ops-uplink".into())
            .spawn(move || serve(url, &global, &thread_running))
            .expect("failed to spawn ops uplink thread");

        Self {
            running,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OpsUplink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(url: BusUrl, global: &Arc<Global>, running: &AtomicBool) {
    let mut buf = vec![0u8; 1024];

    while running.load(Ordering::Acquire) {
        let socket = match RepSocket::open(url, config::BUS_RECV_TIMEOUT) {
            Ok(socket) => {
                tracing::info!("operator uplink listening at '{}'", url);
                socket
            }
            Err(err) => {
                tracing::error!("operator uplink could not bind '{}': {}", url, err);
                std::thread::sleep(config::BUS_RECONNECT_INTERVAL);
                continue;
            }
        };

        while running.load(Ordering::Acquire) {
            let (size, peer) = match socket.recv_request(&mut buf) {
                Ok(request) => request,
                Err(err) if is_timeout(&err) => continue,
                Err(err) => {
                    tracing::debug!("operator uplink error: {}", err);
                    std::thread::sleep(config::BUS_RECONNECT_INTERVAL);
                    break;
                }
            };

            let reply = match OpsMessage::decode(&buf[..size]) {
                Ok(message) => {
                    if handle_message(global, message) {
                        ACK
                    } else {
                        NAK
                    }
                }
                Err(err) => {
                    tracing::warn!("operator uplink received a bad request: {}", err);
                    NAK
                }
            };

            if let Err(err) = socket.reply(&reply, peer) {
                tracing::warn!("operator uplink could not reply: {}", err);
            }
        }
    }
}

/// Dispatch the command, then judge the outcome from the state the
/// supervisor settled in.
fn handle_message(global: &Arc<Global>, message: OpsMessage) -> bool {
    let command = message.clone();
    global.send_event(Event::Ops(match message {
        OpsMessage::Config { path } => OpsEvent::Config { path },
        OpsMessage::StartData => OpsEvent::StartData,
        OpsMessage::StopData => OpsEvent::StopData,
        OpsMessage::StartRun { run_type } => OpsEvent::StartRun { run_type },
        OpsMessage::StopRun => OpsEvent::StopRun,
        OpsMessage::Exit => OpsEvent::Exit,
    }));

    let experiment = global.snapshot().experiment;
    match command {
        OpsMessage::Config { .. } | OpsMessage::StartData | OpsMessage::StopData => {
            experiment == ExperimentState::Ready
        }
        OpsMessage::StartRun { .. } => matches!(
            experiment,
            ExperimentState::StartingRun | ExperimentState::Run
        ),
        OpsMessage::StopRun => matches!(
            experiment,
            ExperimentState::StoppingRun | ExperimentState::Ready
        ),
        OpsMessage::Exit => experiment == ExperimentState::Exit,
    }
}
