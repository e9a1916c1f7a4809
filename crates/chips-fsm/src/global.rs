// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! The shared dispatcher.
//!
//! All five machines live behind one mutex together with an event queue:
//! a reaction that emits further events has them processed before the
//! dispatching call returns, and no two reactions ever interleave. Side
//! effects (bus publications, termination) are collected during the drain
//! and executed after the lock is released.

use crate::events::Event;
use crate::machines::{Effects, Machines, StatesSnapshot};
use crate::master::BusMaster;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

struct DispatchState {
    machines: Machines,
    queue: VecDeque<Event>,
}

/// Process-wide supervisor state.
pub struct Global {
    state: Mutex<DispatchState>,
    master: Arc<BusMaster>,
    terminated: Mutex<bool>,
    terminate_cv: Condvar,
}

impl Global {
    pub fn new(master: Arc<BusMaster>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DispatchState {
                machines: Machines::new(),
                queue: VecDeque::new(),
            }),
            master,
            terminated: Mutex::new(false),
            terminate_cv: Condvar::new(),
        })
    }

    /// Log the initial states and evaluate the first `StateUpdate`.
    pub fn start(&self) {
        self.state.lock().machines.log_initial_states();
        self.send_event(Event::StateUpdate);
    }

    /// Dispatch one event and everything it triggers.
    pub fn send_event(&self, event: Event) {
        let mut fx = Effects::default();
        {
            // Holding the lock across the whole drain serialises
            // reactions: an event emitted by a reaction is processed
            // before any other thread's event gets in.
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.queue.push_back(event);

            while let Some(next) = state.queue.pop_front() {
                state.machines.react(&next, &mut fx);
                fx.drain_pending_into(&mut state.queue);
            }
        }

        for message in fx.publish.drain(..) {
            self.master.publish(message);
        }
        if fx.terminate {
            self.terminate();
        }
    }

    pub fn snapshot(&self) -> StatesSnapshot {
        self.state.lock().machines.snapshot()
    }

    pub fn terminate(&self) {
        let mut terminated = self.terminated.lock();
        *terminated = true;
        self.terminate_cv.notify_all();
    }

    pub fn wait_until_terminated(&self) {
        let mut terminated = self.terminated.lock();
        while !*terminated {
            self.terminate_cv.wait(&mut terminated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DaqoniteEvent, LinkEvent};
    use crate::machines::ExperimentState;
    use chips_daq::config;

    fn test_global() -> Arc<Global> {
        let url = config::CONTROL_BUS_URL.parse().expect("default url");
        Global::new(BusMaster::new(url))
    }

    #[test]
    fn test_cascaded_updates_resolve_before_return() {
        let global = test_global();
        global.start();

        global.send_event(Event::ControlBus(LinkEvent::Connected));
        global.send_event(Event::Daqonite(DaqoniteEvent::Connected));
        global.send_event(Event::Daqonite(DaqoniteEvent::Ready));

        // The Init -> Ready cascade has fully settled.
        assert_eq!(global.snapshot().experiment, ExperimentState::Ready);
    }

    #[test]
    fn test_terminate_unblocks_waiters() {
        let global = test_global();
        let waiter_global = Arc::clone(&global);
        let waiter = std::thread::spawn(move || waiter_global.wait_until_terminated());

        global.send_event(Event::KillSignal);
        waiter.join().expect("waiter returns");
    }
}
