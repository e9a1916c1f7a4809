// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! The five cooperating sub-machines and their joint reactions.
//!
//! Participant machines mirror what each process reports on its state
//! bus; the Experiment machine reads them to drive the run lifecycle.
//! Every transition logs its entry and feeds a `StateUpdate` back into
//! the dispatch queue, so dependent machines re-evaluate before any
//! further external event is processed.

mod control_bus;
mod daqonite;
mod daqontrol;
mod daqsitter;
mod experiment;

pub use control_bus::ControlBusState;
pub use daqonite::DaqoniteState;
pub use daqontrol::DaqontrolState;
pub use daqsitter::DaqsitterState;
pub use experiment::ExperimentState;

use crate::events::{Event, OpsEvent};
use chips_daq::bus::{ControlMessage, OpsMessage};

/// Side effects collected while reacting; executed by the dispatcher
/// after the queue drains.
#[derive(Debug, Default)]
pub struct Effects {
    /// Messages for the control bus.
    pub publish: Vec<ControlMessage>,
    /// The supervisor should shut the process down.
    pub terminate: bool,
    pending: Vec<Event>,
}

impl Effects {
    fn state_update(&mut self) {
        self.pending.push(Event::StateUpdate);
    }

    /// Move reaction-emitted events into the dispatch queue.
    pub fn drain_pending_into(&mut self, queue: &mut std::collections::VecDeque<Event>) {
        queue.extend(self.pending.drain(..));
    }
}

/// One consistent view of all five machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatesSnapshot {
    pub experiment: ExperimentState,
    pub control_bus: ControlBusState,
    pub daqonite: DaqoniteState,
    pub daqontrol: DaqontrolState,
    pub daqsitter: DaqsitterState,
}

/// The aggregate state machine.
#[derive(Debug)]
pub struct Machines {
    experiment: ExperimentState,
    control_bus: ControlBusState,
    daqonite: DaqoniteState,
    daqontrol: DaqontrolState,
    daqsitter: DaqsitterState,
}

impl Default for Machines {
    fn default() -> Self {
        Self::new()
    }
}

impl Machines {
    pub fn new() -> Self {
        Self {
            experiment: ExperimentState::Init,
            control_bus: ControlBusState::Offline,
            daqonite: DaqoniteState::Offline,
            daqontrol: DaqontrolState::Offline,
            daqsitter: DaqsitterState::Offline,
        }
    }

    /// Log the initial state entries, as if each machine had just been
    /// entered.
    pub fn log_initial_states(&self) {
        tracing::info!("Experiment : {}", self.experiment.name());
        tracing::info!("ControlBus : {}", self.control_bus.name());
        tracing::info!("Daqonite : {}", self.daqonite.name());
        tracing::info!("Daqontrol : {}", self.daqontrol.name());
        tracing::info!("Daqsitter : {}", self.daqsitter.name());
    }

    pub fn snapshot(&self) -> StatesSnapshot {
        StatesSnapshot {
            experiment: self.experiment,
            control_bus: self.control_bus,
            daqonite: self.daqonite,
            daqontrol: self.daqontrol,
            daqsitter: self.daqsitter,
        }
    }

    /// React to one event. Reactions never block; side effects accumulate
    /// in `fx`.
    pub fn react(&mut self, event: &Event, fx: &mut Effects) {
        match event {
            Event::StateUpdate => self.react_state_update(fx),
            Event::KillSignal => {
                tracing::info!("received kill signal, terminating");
                self.transit_experiment(ExperimentState::Exit, fx);
            }
            Event::Ops(op) => self.react_ops(op, fx),
            Event::ControlBus(link) => {
                if let Some(next) = self.control_bus.react(*link) {
                    self.control_bus = next;
                    tracing::info!("ControlBus : {}", next.name());
                    fx.state_update();
                }
            }
            Event::Daqonite(ev) => {
                if let Some(next) = self.daqonite.react(*ev) {
                    self.daqonite = next;
                    tracing::info!("Daqonite : {}", next.name());
                    fx.state_update();
                }
            }
            Event::Daqontrol(ev) => {
                if let Some(next) = self.daqontrol.react(*ev) {
                    self.daqontrol = next;
                    tracing::info!("Daqontrol : {}", next.name());
                    fx.state_update();
                }
            }
            Event::Daqsitter(ev) => {
                if let Some(next) = self.daqsitter.react(*ev) {
                    self.daqsitter = next;
                    tracing::info!("Daqsitter : {}", next.name());
                    fx.state_update();
                }
            }
        }
    }

    fn transit_experiment(&mut self, next: ExperimentState, fx: &mut Effects) {
        if self.experiment == next {
            return;
        }
        self.experiment = next;
        tracing::info!("Experiment : {}", next.name());
        fx.state_update();

        if next == ExperimentState::Exit {
            fx.terminate = true;
        }
    }

    fn react_state_update(&mut self, fx: &mut Effects) {
        match self.experiment {
            ExperimentState::Init => {
                if self.control_bus == ControlBusState::Online
                    && self.daqonite == DaqoniteState::Ready
                {
                    self.transit_experiment(ExperimentState::Ready, fx);
                }
            }
            ExperimentState::StartingRun => {
                if self.control_bus != ControlBusState::Online {
                    self.transit_experiment(ExperimentState::Error, fx);
                } else if !matches!(self.daqonite, DaqoniteState::Ready | DaqoniteState::Running) {
                    self.transit_experiment(ExperimentState::Error, fx);
                } else if self.daqonite == DaqoniteState::Running {
                    self.transit_experiment(ExperimentState::Run, fx);
                }
            }
            ExperimentState::StoppingRun => {
                if self.control_bus != ControlBusState::Online {
                    self.transit_experiment(ExperimentState::Error, fx);
                } else if self.daqonite == DaqoniteState::Ready {
                    self.transit_experiment(ExperimentState::Ready, fx);
                }
            }
            _ => {}
        }
    }

    fn react_ops(&mut self, op: &OpsEvent, fx: &mut Effects) {
        match (self.experiment, op) {
            (ExperimentState::Ready, OpsEvent::Config { path }) => {
                fx.publish
                    .push(ControlMessage(OpsMessage::Config { path: path.clone() }));
            }
            (ExperimentState::Ready, OpsEvent::StartData) => {
                fx.publish.push(ControlMessage(OpsMessage::StartData));
            }
            (ExperimentState::Ready, OpsEvent::StopData) => {
                fx.publish.push(ControlMessage(OpsMessage::StopData));
            }
            (ExperimentState::Ready, OpsEvent::StartRun { run_type }) => {
                fx.publish
                    .push(ControlMessage(OpsMessage::StartRun { run_type: *run_type }));
                self.transit_experiment(ExperimentState::StartingRun, fx);
            }
            (ExperimentState::Run, OpsEvent::StopRun) => {
                fx.publish.push(ControlMessage(OpsMessage::StopRun));
                self.transit_experiment(ExperimentState::StoppingRun, fx);
            }
            (_, OpsEvent::Exit) => {
                fx.publish.push(ControlMessage(OpsMessage::Exit));
                self.transit_experiment(ExperimentState::Exit, fx);
            }
            // Anything else does not transition; the uplink answers NAK
            // from the unchanged state.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DaqoniteEvent, LinkEvent};
    use chips_daq::run::RunType;
    use std::collections::VecDeque;

    /// Drive the aggregate the way the dispatcher does: queue, drain,
    /// collect effects.
    fn dispatch(machines: &mut Machines, event: Event) -> Effects {
        let mut fx = Effects::default();
        let mut queue = VecDeque::new();
        queue.push_back(event);
        while let Some(ev) = queue.pop_front() {
            machines.react(&ev, &mut fx);
            fx.drain_pending_into(&mut queue);
        }
        fx
    }

    fn bring_online(machines: &mut Machines) {
        dispatch(machines, Event::ControlBus(LinkEvent::Connected));
        dispatch(machines, Event::Daqonite(DaqoniteEvent::Connected));
        dispatch(machines, Event::Daqonite(DaqoniteEvent::Ready));
    }

    #[test]
    fn test_init_to_ready_when_participants_arrive() {
        let mut machines = Machines::new();
        assert_eq!(machines.snapshot().experiment, ExperimentState::Init);

        dispatch(&mut machines, Event::ControlBus(LinkEvent::Connected));
        assert_eq!(machines.snapshot().experiment, ExperimentState::Init);

        dispatch(&mut machines, Event::Daqonite(DaqoniteEvent::Connected));
        dispatch(&mut machines, Event::Daqonite(DaqoniteEvent::Ready));
        assert_eq!(machines.snapshot().experiment, ExperimentState::Ready);
    }

    #[test]
    fn test_full_run_cycle() {
        let mut machines = Machines::new();
        bring_online(&mut machines);

        let fx = dispatch(
            &mut machines,
            Event::Ops(OpsEvent::StartRun { run_type: RunType::DataNormal }),
        );
        assert_eq!(machines.snapshot().experiment, ExperimentState::StartingRun);
        assert_eq!(
            fx.publish,
            vec![ControlMessage(OpsMessage::StartRun { run_type: RunType::DataNormal })]
        );

        // Daqonite observes Running -> the experiment follows.
        dispatch(
            &mut machines,
            Event::Daqonite(DaqoniteEvent::Running(RunType::DataNormal)),
        );
        assert_eq!(machines.snapshot().experiment, ExperimentState::Run);

        let fx = dispatch(&mut machines, Event::Ops(OpsEvent::StopRun));
        assert_eq!(machines.snapshot().experiment, ExperimentState::StoppingRun);
        assert_eq!(fx.publish, vec![ControlMessage(OpsMessage::StopRun)]);

        dispatch(&mut machines, Event::Daqonite(DaqoniteEvent::Ready));
        assert_eq!(machines.snapshot().experiment, ExperimentState::Ready);
    }

    #[test]
    fn test_start_run_outside_ready_is_ignored() {
        let mut machines = Machines::new();
        let fx = dispatch(
            &mut machines,
            Event::Ops(OpsEvent::StartRun { run_type: RunType::DataNormal }),
        );
        assert!(fx.publish.is_empty());
        assert_eq!(machines.snapshot().experiment, ExperimentState::Init);
    }

    #[test]
    fn test_bus_loss_during_start_is_an_error() {
        let mut machines = Machines::new();
        bring_online(&mut machines);
        dispatch(
            &mut machines,
            Event::Ops(OpsEvent::StartRun { run_type: RunType::Calibration }),
        );

        dispatch(&mut machines, Event::ControlBus(LinkEvent::Disconnected));
        assert_eq!(machines.snapshot().experiment, ExperimentState::Error);
    }

    #[test]
    fn test_daqonite_loss_during_start_is_an_error() {
        let mut machines = Machines::new();
        bring_online(&mut machines);
        dispatch(
            &mut machines,
            Event::Ops(OpsEvent::StartRun { run_type: RunType::Calibration }),
        );

        dispatch(&mut machines, Event::Daqonite(DaqoniteEvent::Disconnected));
        assert_eq!(machines.snapshot().experiment, ExperimentState::Error);
    }

    #[test]
    fn test_exit_from_any_state_terminates() {
        let mut machines = Machines::new();
        let fx = dispatch(&mut machines, Event::Ops(OpsEvent::Exit));
        assert!(fx.terminate);
        assert_eq!(machines.snapshot().experiment, ExperimentState::Exit);
        assert_eq!(fx.publish, vec![ControlMessage(OpsMessage::Exit)]);
    }

    #[test]
    fn test_kill_signal_terminates() {
        let mut machines = Machines::new();
        let fx = dispatch(&mut machines, Event::KillSignal);
        assert!(fx.terminate);
        assert_eq!(machines.snapshot().experiment, ExperimentState::Exit);
    }

    #[test]
    fn test_repeated_status_causes_no_churn() {
        let mut machines = Machines::new();
        bring_online(&mut machines);

        // The 200 ms status stream re-reports Ready forever.
        for _ in 0..5 {
            let fx = dispatch(&mut machines, Event::Daqonite(DaqoniteEvent::Ready));
            assert!(fx.publish.is_empty());
            assert!(!fx.terminate);
        }
        assert_eq!(machines.snapshot().experiment, ExperimentState::Ready);
    }
}
