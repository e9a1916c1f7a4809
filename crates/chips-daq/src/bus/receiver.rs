// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Control-command reception.
//!
//! A subscriber loop with a short recv timeout so the running flag is
//! observed promptly; transport errors re-open the subscription after a
//! fixed back-off.

use crate::bus::msg::ControlMessage;
use crate::bus::socket::{is_timeout, BusUrl, SubSocket};
use crate::bus::OpsMessage;
use crate::config;
use crate::run::RunType;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Reactions to run-lifecycle commands.
pub trait CommandHandler: Send + Sync {
    fn handle_config(&self, path: &str);
    fn handle_start_data(&self);
    fn handle_stop_data(&self);
    fn handle_start_run(&self, run_type: RunType);
    fn handle_stop_run(&self);
    fn handle_exit(&self);
}

/// Subscriber loop dispatching [`ControlMessage`]s to a handler.
pub struct CommandReceiver {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandReceiver {
    pub fn start(url: BusUrl, handler: Arc<dyn CommandHandler>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("chips-cmd-rx".into())
            .spawn(move || receiver_thread(url, &thread_running, &handler))
            .expect("failed to spawn command receiver thread");

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

impl Drop for CommandReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receiver_thread(url: BusUrl, running: &AtomicBool, handler: &Arc<dyn CommandHandler>) {
    log::info!("[CommandReceiver] started");

    let mut buf = vec![0u8; 1024];
    while running.load(Ordering::Acquire) {
        let socket = match SubSocket::open(url, config::BUS_RECV_TIMEOUT) {
            Ok(socket) => socket,
            Err(err) => {
                log::error!("[CommandReceiver] could not subscribe to '{}': {}", url, err);
                log::info!("[CommandReceiver] will reconnect in 5 seconds");
                std::thread::sleep(config::BUS_RECONNECT_INTERVAL);
                continue;
            }
        };

        while running.load(Ordering::Acquire) {
            let size = match socket.recv(&mut buf) {
                Ok(size) => size,
                Err(err) if is_timeout(&err) => continue,
                Err(err) => {
                    log::error!("[CommandReceiver] error when listening: {}", err);
                    log::info!("[CommandReceiver] will reconnect in 5 seconds");
                    std::thread::sleep(config::BUS_RECONNECT_INTERVAL);
                    break;
                }
            };

            match ControlMessage::decode(&buf[..size]) {
                Ok(ControlMessage(command)) => dispatch(handler, command),
                Err(err) => {
                    log::warn!("[CommandReceiver] got undecodable message: {}", err);
                }
            }
        }
    }

    log::info!("[CommandReceiver] finished");
}

fn dispatch(handler: &Arc<dyn CommandHandler>, command: OpsMessage) {
    match command {
        OpsMessage::Config { path } => handler.handle_config(&path),
        OpsMessage::StartData => handler.handle_start_data(),
        OpsMessage::StopData => handler.handle_stop_data(),
        OpsMessage::StartRun { run_type } => handler.handle_start_run(run_type),
        OpsMessage::StopRun => handler.handle_stop_run(),
        OpsMessage::Exit => handler.handle_exit(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::socket::PubSocket;
    use std::net::UdpSocket;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingHandler {
        start_runs: AtomicU32,
        stop_runs: AtomicU32,
        exits: AtomicU32,
    }

    impl CommandHandler for CountingHandler {
        fn handle_config(&self, _path: &str) {}
        fn handle_start_data(&self) {}
        fn handle_stop_data(&self) {}
        fn handle_start_run(&self, _run_type: RunType) {
            self.start_runs.fetch_add(1, Ordering::Relaxed);
        }
        fn handle_stop_run(&self) {
            self.stop_runs.fetch_add(1, Ordering::Relaxed);
        }
        fn handle_exit(&self) {
            self.exits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn free_unicast_url() -> BusUrl {
        let probe = UdpSocket::bind(("127.0.0.1", 0)).expect("probe bind");
        let port = probe.local_addr().expect("probe addr").port();
        drop(probe);
        format!("udp://127.0.0.1:{}", port).parse().expect("url")
    }

    #[test]
    fn test_commands_reach_handler() {
        let url = free_unicast_url();
        let handler = Arc::new(CountingHandler::default());
        let receiver = CommandReceiver::start(url, Arc::clone(&handler) as Arc<dyn CommandHandler>);

        // Give the subscriber a moment to bind.
        std::thread::sleep(Duration::from_millis(50));
        let publisher = PubSocket::open(url).expect("pub");
        publisher
            .publish(&ControlMessage(OpsMessage::StartRun { run_type: RunType::DataNormal }).encode())
            .expect("publish");
        publisher
            .publish(&ControlMessage(OpsMessage::StopRun).encode())
            .expect("publish");
        // Garbage is logged, not fatal.
        publisher.publish(&[9, 9, 9]).expect("publish");
        publisher
            .publish(&ControlMessage(OpsMessage::Exit).encode())
            .expect("publish");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handler.exits.load(Ordering::Relaxed) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(handler.start_runs.load(Ordering::Relaxed), 1);
        assert_eq!(handler.stop_runs.load(Ordering::Relaxed), 1);
        assert_eq!(handler.exits.load(Ordering::Relaxed), 1);

        receiver.stop();
    }
}
