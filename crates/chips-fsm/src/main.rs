// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! The CHIPS experiment supervisor.
//!
//! Runs the five coordinated sub-machines (Experiment, ControlBus,
//! Daqonite, Daqontrol, Daqsitter), broadcasts run-lifecycle commands on
//! the control bus, observes every participant's state bus, and answers
//! operator commands on the uplink.
//!
//! # Usage
//!
//! ```bash
//! # Default bus endpoints
//! fsm
//!
//! # Explicit endpoints
//! fsm --ops-bus udp://127.0.0.1:56070 --control-bus udp://239.255.86.1:56071
//! ```

mod events;
mod global;
mod machines;
mod master;
mod observer;
mod reporter;
mod uplink;

use chips_daq::bus::BusUrl;
use chips_daq::config as defaults;
use clap::Parser;
use events::Event;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// CHIPS experiment supervisor.
#[derive(Parser, Debug)]
#[command(name = "fsm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Operator uplink endpoint (request/reply)
    #[arg(long, default_value = defaults::OPS_BUS_URL)]
    ops_bus: String,

    /// Control command bus (publish)
    #[arg(long, default_value = defaults::CONTROL_BUS_URL)]
    control_bus: String,

    /// Daqonite state bus (subscribe)
    #[arg(long, default_value = defaults::DAQONITE_BUS_URL)]
    daqonite_bus: String,

    /// Daqontrol state bus (subscribe)
    #[arg(long, default_value = defaults::DAQONTROL_BUS_URL)]
    daqontrol_bus: String,

    /// Daqsitter state bus (subscribe)
    #[arg(long, default_value = defaults::DAQSITTER_BUS_URL)]
    daqsitter_bus: String,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let ops_bus: BusUrl = args.ops_bus.parse()?;
    let control_bus: BusUrl = args.control_bus.parse()?;
    let daqonite_bus: BusUrl = args.daqonite_bus.parse()?;
    let daqontrol_bus: BusUrl = args.daqontrol_bus.parse()?;
    let daqsitter_bus: BusUrl = args.daqsitter_bus.parse()?;

    tracing::info!("FSM started");

    let master = master::BusMaster::new(control_bus);
    let global = global::Global::new(Arc::clone(&master));
    global.start();

    Arc::clone(&master).start(Arc::clone(&global));
    let daqonite = observer::Observer::daqonite(daqonite_bus, Arc::clone(&global));
    let daqontrol = observer::Observer::daqontrol(daqontrol_bus, Arc::clone(&global));
    let daqsitter = observer::Observer::daqsitter(daqsitter_bus, Arc::clone(&global));
    let uplink = uplink::OpsUplink::start(ops_bus, Arc::clone(&global));
    let reporter = reporter::Reporter::start(Arc::clone(&global));

    let signal_global = Arc::clone(&global);
    ctrlc::set_handler(move || {
        signal_global.send_event(Event::KillSignal);
    })?;

    global.wait_until_terminated();

    reporter.stop();
    uplink.stop();
    daqsitter.stop();
    daqontrol.stop();
    daqonite.stop();
    master.stop();

    tracing::info!("FSM finished");
    Ok(())
}
