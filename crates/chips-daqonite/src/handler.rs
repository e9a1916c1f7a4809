// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! The DAQ handler: owns the receiver pool, the spill schedule and the
//! run lifecycle, and reacts to control-bus commands.

use crate::config::DaqoniteConfig;
use chips_daq::bus::{CommandHandler, DaqoniteStateMessage, StateSource};
use chips_daq::receiver::HitReceiver;
use chips_daq::run::{DataRun, RunNumberStore, RunType, SchedulerKind};
use chips_daq::scheduler::{
    InfiniteScheduler, PeriodicScheduler, SpillScheduler, TduSpillScheduler,
};
use chips_daq::serialise::RunSerialiser;
use chips_daq::spill::SpillSchedule;
use chips_daq::config as defaults;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

struct ActiveRun {
    run: Arc<DataRun>,
    serialiser: Arc<RunSerialiser>,
}

/// Central daemon state; implements the control-bus command contract and
/// publishes the Daqonite state.
pub struct DaqHandler {
    config: DaqoniteConfig,
    schedule: Arc<SpillSchedule>,
    receivers: Mutex<Vec<HitReceiver>>,
    run_numbers: RunNumberStore,
    current_run: Mutex<Option<ActiveRun>>,
    terminate: Mutex<bool>,
    terminate_cv: Condvar,
}

impl DaqHandler {
    pub fn new(config: DaqoniteConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.output_directory)?;
        let run_numbers = RunNumberStore::new(config.output_directory.join("run_numbers.dat"));

        let handler = Arc::new(Self {
            config,
            schedule: Arc::new(SpillSchedule::new()),
            receivers: Mutex::new(Vec::new()),
            run_numbers,
            current_run: Mutex::new(None),
            terminate: Mutex::new(false),
            terminate_cv: Condvar::new(),
        });
        handler.create_hit_receivers()?;
        Ok(handler)
    }

    /// (Re)build the receiver pool from the configured ports.
    fn create_hit_receivers(&self) -> anyhow::Result<()> {
        let mut receivers = self.receivers.lock();
        receivers.clear();

        for &port in &self.config.clb_ports {
            receivers.push(HitReceiver::clb(&self.schedule, port)?);
        }
        for &port in &self.config.bbb_ports {
            receivers.push(HitReceiver::bbb(&self.schedule, port)?);
        }

        tracing::info!(
            clb = self.config.clb_ports.len(),
            bbb = self.config.bbb_ports.len(),
            "hit receivers ready"
        );
        Ok(())
    }

    fn build_scheduler(
        &self,
        run_type: RunType,
    ) -> anyhow::Result<(Arc<dyn SpillScheduler>, SchedulerKind)> {
        if run_type.is_test() {
            let scheduler: Arc<dyn SpillScheduler> = Arc::new(InfiniteScheduler);
            return Ok((scheduler, SchedulerKind::Infinite));
        }

        if let Some(port) = self.config.trigger_port {
            let scheduler: Arc<dyn SpillScheduler> = Arc::new(TduSpillScheduler::with_defaults(
                port,
                self.config.trigger_period_guess_secs,
            )?);
            return Ok((scheduler, SchedulerKind::ExternallyTriggered));
        }

        let scheduler: Arc<dyn SpillScheduler> = Arc::new(PeriodicScheduler::new(
            defaults::SPILLS_AHEAD,
            Duration::from_millis(self.config.spill_duration_ms),
        ));
        Ok((scheduler, SchedulerKind::Periodic))
    }

    /// Block until an Exit command or signal arrives.
    pub fn wait_until_terminated(&self) {
        let mut terminated = self.terminate.lock();
        while !*terminated {
            self.terminate_cv.wait(&mut terminated);
        }
    }

    fn terminate(&self) {
        let mut terminated = self.terminate.lock();
        *terminated = true;
        self.terminate_cv.notify_all();
    }

    /// Stop everything on the way out of the process.
    pub fn shutdown(&self) {
        self.handle_stop_run();
        for receiver in self.receivers.lock().iter() {
            receiver.shutdown();
        }
    }
}

impl CommandHandler for DaqHandler {
    fn handle_config(&self, path: &str) {
        tracing::info!(path, "config");
        if self.current_run.lock().is_some() {
            tracing::warn!("ignoring config command during an active run");
            return;
        }
        if let Err(err) = self.create_hit_receivers() {
            tracing::error!(%err, "could not rebuild hit receivers");
        }
    }

    fn handle_start_data(&self) {
        tracing::info!("starting data");
        for receiver in self.receivers.lock().iter() {
            receiver.start_data();
        }
    }

    fn handle_stop_data(&self) {
        tracing::info!("stopping data");
        for receiver in self.receivers.lock().iter() {
            receiver.stop_data();
        }
    }

    fn handle_start_run(&self, run_type: RunType) {
        // A run in progress is stopped first.
        self.handle_stop_run();

        let number = match self.run_numbers.next_run_number(run_type) {
            Ok(number) => number,
            Err(err) => {
                tracing::error!(%err, "could not allocate a run number");
                return;
            }
        };

        let (scheduler, kind) = match self.build_scheduler(run_type) {
            Ok(built) => built,
            Err(err) => {
                tracing::error!(%err, "could not build the spill scheduler");
                return;
            }
        };

        let run = Arc::new(DataRun::new(
            number,
            run_type,
            kind,
            &self.config.output_directory,
        ));
        run.start();
        tracing::info!(run = %run.log_description(), "started data run");

        let serialiser = RunSerialiser::start(Arc::clone(&run));
        Arc::clone(&self.schedule).start_run(scheduler, Arc::clone(&serialiser));

        for receiver in self.receivers.lock().iter() {
            receiver.start_run();
        }

        *self.current_run.lock() = Some(ActiveRun { run, serialiser });
    }

    fn handle_stop_run(&self) {
        let Some(active) = self.current_run.lock().take() else {
            return;
        };

        active.run.stop();
        tracing::info!(run = %active.run.log_description(), "stopped data run");

        for receiver in self.receivers.lock().iter() {
            receiver.stop_run();
        }

        // The schedule drains its open spills into the serialiser, then
        // the serialiser drains its queue into the file.
        self.schedule.stop_run();
        active.serialiser.stop();
    }

    fn handle_exit(&self) {
        tracing::info!("exit");
        self.handle_stop_run();
        self.handle_stop_data();
        self.terminate();
    }
}

impl StateSource for DaqHandler {
    fn current_state(&self) -> Vec<u8> {
        let message = match self.current_run.lock().as_ref() {
            Some(active) => DaqoniteStateMessage::Running {
                run_type: active.run.run_type(),
            },
            None => DaqoniteStateMessage::Ready,
        };
        message.encode()
    }
}
