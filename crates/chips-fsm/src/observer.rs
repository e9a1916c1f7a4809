// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Participant observers.
//!
//! One subscriber loop per observed participant. Participants publish
//! their state every 200 ms, so a full second of silence means the
//! participant is gone: the recv timeout raises `Disconnected` just like
//! a transport error, and the subscription is re-opened after a back-off.

use crate::events::{DaqoniteEvent, DaqontrolEvent, DaqsitterEvent, Event};
use crate::global::Global;
use chips_daq::bus::{
    BusUrl, DaqoniteStateMessage, DaqontrolStateMessage, DaqsitterStateMessage, SubSocket,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const OBSERVER_RECV_TIMEOUT: Duration = Duration::from_millis(1000);
const OBSERVER_RECONNECT: Duration = Duration::from_millis(500);

/// A subscriber thread mapping one participant's state bus to events.
pub struct Observer {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Observer {
    /// Observe the Daqonite state bus.
    pub fn daqonite(url: BusUrl, global: Arc<Global>) -> Self {
        Self::start("daqonite", url, global, |wire| {
            let message = DaqoniteStateMessage::decode(wire).ok()?;
            Some(Event::Daqonite(match message {
                DaqoniteStateMessage::Ready => DaqoniteEvent::Ready,
                DaqoniteStateMessage::Running { run_type } => DaqoniteEvent::Running(run_type),
            }))
        }, Event::Daqonite(DaqoniteEvent::Connected), Event::Daqonite(DaqoniteEvent::Disconnected))
    }

    /// Observe the Daqontrol state bus.
    pub fn daqontrol(url: BusUrl, global: Arc<Global>) -> Self {
        Self::start("daqontrol", url, global, |wire| {
            let message = DaqontrolStateMessage::decode(wire).ok()?;
            Some(Event::Daqontrol(match message {
                DaqontrolStateMessage::Initialising => DaqontrolEvent::Initialising,
                DaqontrolStateMessage::Ready => DaqontrolEvent::Ready,
                DaqontrolStateMessage::Configured => DaqontrolEvent::Configured,
                DaqontrolStateMessage::Started => DaqontrolEvent::Started,
            }))
        }, Event::Daqontrol(DaqontrolEvent::Connected), Event::Daqontrol(DaqontrolEvent::Disconnected))
    }

    /// Observe the Daqsitter state bus.
    pub fn daqsitter(url: BusUrl, global: Arc<Global>) -> Self {
        Self::start("daqsitter", url, global, |wire| {
            let message = DaqsitterStateMessage::decode(wire).ok()?;
            Some(Event::Daqsitter(match message {
                DaqsitterStateMessage::Ready => DaqsitterEvent::Ready,
                DaqsitterStateMessage::Started => DaqsitterEvent::Started,
            }))
        }, Event::Daqsitter(DaqsitterEvent::Connected), Event::Daqsitter(DaqsitterEvent::Disconnected))
    }

    fn start<F>(
        name: &'static str,
        url: BusUrl,
        global: Arc<Global>,
        decode: F,
        connected: Event,
        disconnected: Event,
    ) -> Self
    where
        F: Fn(&[u8]) -> Option<Event> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name(format!("chips-observe-{}", name))
            .spawn(move || {
                observe(name, url, &global, &thread_running, &decode, &connected, &disconnected);
            })
            .expect("failed to spawn observer thread");

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

impl Drop for Observer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn observe<F>(
    name: &str,
    url: BusUrl,
    global: &Arc<Global>,
    running: &AtomicBool,
    decode: &F,
    connected: &Event,
    disconnected: &Event,
) where
    F: Fn(&[u8]) -> Option<Event>,
{
    let mut buf = vec![0u8; 1024];

    while running.load(Ordering::Acquire) {
        let socket = match SubSocket::open(url, OBSERVER_RECV_TIMEOUT) {
            Ok(socket) => socket,
            Err(err) => {
                tracing::debug!("{} observer error: {}", name, err);
                global.send_event(disconnected.clone());
                std::thread::sleep(OBSERVER_RECONNECT);
                continue;
            }
        };

        global.send_event(connected.clone());

        while running.load(Ordering::Acquire) {
            match socket.recv(&mut buf) {
                Ok(size) => match decode(&buf[..size]) {
                    Some(event) => global.send_event(event),
                    None => {
                        tracing::warn!("{} observer received an undecodable message", name);
                    }
                },
                Err(err) => {
                    // Timeout or transport failure: either way the
                    // participant is no longer heard from.
                    tracing::debug!("{} observer error: {}", name, err);
                    global.send_event(disconnected.clone());
                    std::thread::sleep(OBSERVER_RECONNECT);
                    break;
                }
            }
        }
    }
}
