// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Participant state publication.
//!
//! Two threads per publisher: a status thread that samples the component's
//! state every 200 ms and a communication thread that drains the queue
//! into the pub socket, re-opening it with a fixed back-off after
//! transport errors.

use crate::bus::socket::{BusUrl, PubSocket};
use crate::config;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Provider of the current state message, sampled periodically.
pub trait StateSource: Send + Sync {
    /// Encoded state message, ready for the wire.
    fn current_state(&self) -> Vec<u8>;
}

struct PublishQueue {
    queue: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
}

/// Periodic state publisher for one bus topic.
pub struct BusPublisher {
    running: Arc<AtomicBool>,
    shared: Arc<PublishQueue>,
    comm_thread: Mutex<Option<JoinHandle<()>>>,
    status_thread: Mutex<Option<JoinHandle<()>>>,
}

impl BusPublisher {
    /// Start publishing `source`'s state to `url`.
    pub fn start(url: BusUrl, source: Arc<dyn StateSource>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(PublishQueue {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        });

        let comm_running = Arc::clone(&running);
        let comm_shared = Arc::clone(&shared);
        let comm_thread = std::thread::Builder::new()
            .name("chips-bus-pub".into())
            .spawn(move || communication_thread(url, &comm_running, &comm_shared))
            .expect("failed to spawn bus publisher thread");

        let status_running = Arc::clone(&running);
        let status_shared = Arc::clone(&shared);
        let status_thread = std::thread::Builder::new()
            .name("chips-bus-status".into())
            .spawn(move || status_thread(&status_running, &status_shared, &source))
            .expect("failed to spawn bus status thread");

        Self {
            running,
            shared,
            comm_thread: Mutex::new(Some(comm_thread)),
            status_thread: Mutex::new(Some(status_thread)),
        }
    }

    /// Queue one message out of band of the periodic status.
    pub fn publish(&self, message: Vec<u8>) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(message);
        self.shared.cv.notify_one();
    }

    /// Stop both threads, flushing nothing further.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.cv.notify_all();

        if let Some(handle) = self.status_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.comm_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BusPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn status_thread(running: &AtomicBool, shared: &Arc<PublishQueue>, source: &Arc<dyn StateSource>) {
    log::info!("[BusPublisher] status thread started");

    while running.load(Ordering::Acquire) {
        {
            let mut queue = shared.queue.lock();
            queue.push_back(source.current_state());
            shared.cv.notify_one();
        }

        let mut guard = shared.queue.lock();
        // The condvar doubles as the shutdown signal.
        shared
            .cv
            .wait_for(&mut guard, config::BUS_STATUS_INTERVAL);
    }

    log::info!("[BusPublisher] status thread finished");
}

fn communication_thread(url: BusUrl, running: &AtomicBool, shared: &Arc<PublishQueue>) {
    log::info!("[BusPublisher] communication thread started");

    while running.load(Ordering::Acquire) {
        let socket = match PubSocket::open(url) {
            Ok(socket) => {
                log::info!("[BusPublisher] publishing to '{}'", url);
                socket
            }
            Err(err) => {
                log::error!("[BusPublisher] could not open '{}': {}", url, err);
                std::thread::sleep(config::BUS_RECONNECT_INTERVAL);
                continue;
            }
        };

        'drain: loop {
            let mut queue = shared.queue.lock();

            while let Some(front) = queue.front() {
                if let Err(err) = socket.publish(front) {
                    // Keep the message for the next socket.
                    log::error!("[BusPublisher] publish error: {}", err);
                    drop(queue);
                    std::thread::sleep(config::BUS_RECONNECT_INTERVAL);
                    break 'drain;
                }
                queue.pop_front();
            }

            if !running.load(Ordering::Acquire) {
                return;
            }
            // Timed wait: a shutdown raced between the flag check and the
            // wait is picked up at the next tick.
            shared.cv.wait_for(&mut queue, config::BUS_STATUS_INTERVAL);
        }
    }

    log::info!("[BusPublisher] communication thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::socket::SubSocket;
    use std::net::UdpSocket;
    use std::time::Duration;

    struct FixedState(Vec<u8>);

    impl StateSource for FixedState {
        fn current_state(&self) -> Vec<u8> {
            self.0.clone()
        }
    }

    fn free_unicast_url() -> BusUrl {
        let probe = UdpSocket::bind(("127.0.0.1", 0)).expect("probe bind");
        let port = probe.local_addr().expect("probe addr").port();
        drop(probe);
        format!("udp://127.0.0.1:{}", port).parse().expect("url")
    }

    #[test]
    fn test_periodic_status_reaches_subscriber() {
        let url = free_unicast_url();
        let subscriber = SubSocket::open(url, Duration::from_millis(1000)).expect("sub");

        let publisher = BusPublisher::start(url, Arc::new(FixedState(vec![0, 7])));

        let mut buf = [0u8; 16];
        let size = subscriber.recv(&mut buf).expect("status arrives");
        assert_eq!(&buf[..size], &[0, 7]);

        publisher.stop();
    }

    #[test]
    fn test_out_of_band_publish() {
        let url = free_unicast_url();
        let subscriber = SubSocket::open(url, Duration::from_millis(1000)).expect("sub");
        let publisher = BusPublisher::start(url, Arc::new(FixedState(vec![0, 1])));

        publisher.publish(vec![0, 2, 3]);

        // Both the periodic state and the queued message arrive.
        let mut seen_oob = false;
        let mut buf = [0u8; 16];
        for _ in 0..10 {
            let size = subscriber.recv(&mut buf).expect("message");
            if &buf[..size] == [0, 2, 3] {
                seen_oob = true;
                break;
            }
        }
        assert!(seen_oob);

        publisher.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let url = free_unicast_url();
        let publisher = BusPublisher::start(url, Arc::new(FixedState(vec![0, 0])));
        publisher.stop();
        publisher.stop();
    }
}
