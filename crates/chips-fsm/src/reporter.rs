// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Periodic state reporter.
//!
//! Logs every machine's current state every two seconds, so operators can
//! tail the supervisor log instead of interrogating it.

use crate::global::Global;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const REPORT_INTERVAL: Duration = Duration::from_millis(2000);

pub struct Reporter {
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Reporter {
    pub fn start(global: Arc<Global>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("chips-reporter".into())
            .spawn(move || {
                while thread_running.load(Ordering::Acquire) {
                    std::thread::sleep(REPORT_INTERVAL);
                    let states = global.snapshot();
                    tracing::info!(
                        experiment = states.experiment.name(),
                        control_bus = states.control_bus.name(),
                        daqonite = states.daqonite.name(),
                        daqontrol = states.daqontrol.name(),
                        daqsitter = states.daqsitter.name(),
                        "state report"
                    );
                }
            })
            .expect("failed to spawn reporter thread");

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

impl Drop for Reporter {
    fn drop(&mut self) {
        self.stop();
    }
}
