// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Control-bus master.
//!
//! Publishes run-lifecycle commands to the control bus. Opening the
//! socket raises `Connected`; any publish failure raises `Disconnected`
//! and re-opens the socket after a fixed back-off.

use crate::events::{Event, LinkEvent};
use crate::global::Global;
use chips_daq::bus::{BusUrl, ControlMessage, PubSocket};
use chips_daq::config;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct BusMaster {
    url: BusUrl,
    queue: Mutex<VecDeque<ControlMessage>>,
    cv: Condvar,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BusMaster {
    pub fn new(url: BusUrl) -> Arc<Self> {
        Arc::new(Self {
            url,
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            running: AtomicBool::new(true),
            worker: Mutex::new(None),
        })
    }

    /// Start the publishing thread. Needs the global for link events, so
    /// it cannot run before the global exists.
    pub fn start(self: Arc<Self>, global: Arc<Global>) {
        let master = Arc::clone(&self);
        let handle = std::thread::Builder::new()
            .name("chips-bus-master".into())
            .spawn(move || master.run(&global))
            .expect("failed to spawn bus master thread");
        *self.worker.lock() = Some(handle);
    }

    /// Queue one command for publication.
    pub fn publish(&self, message: ControlMessage) {
        let mut queue = self.queue.lock();
        queue.push_back(message);
        self.cv.notify_one();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.cv.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(&self, global: &Arc<Global>) {
        while self.running.load(Ordering::Acquire) {
            let socket = match PubSocket::open(self.url) {
                Ok(socket) => {
                    tracing::info!("ControlBus publishing to '{}'", self.url);
                    global.send_event(Event::ControlBus(LinkEvent::Connected));
                    socket
                }
                Err(err) => {
                    tracing::error!("ControlBus could not open '{}': {}", self.url, err);
                    global.send_event(Event::ControlBus(LinkEvent::Disconnected));
                    std::thread::sleep(config::BUS_RECONNECT_INTERVAL);
                    continue;
                }
            };

            'publish: while self.running.load(Ordering::Acquire) {
                let mut queue = self.queue.lock();

                while let Some(front) = queue.front() {
                    if let Err(err) = socket.publish(&front.encode()) {
                        tracing::error!("ControlBus caught error: {}", err);
                        drop(queue);
                        global.send_event(Event::ControlBus(LinkEvent::Disconnected));
                        std::thread::sleep(config::BUS_RECONNECT_INTERVAL);
                        break 'publish;
                    }
                    queue.pop_front();
                }

                self.cv.wait_for(&mut queue, config::BUS_RECV_TIMEOUT);
            }
        }
    }
}
