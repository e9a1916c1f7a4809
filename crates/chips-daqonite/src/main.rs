// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Daqonite - the CHIPS DAQ daemon.
//!
//! Receives optical datagrams from CLB and BBB planes, buckets them into
//! scheduled spills, time-sorts each closed spill and writes it to the
//! per-run file. Driven over the control bus; publishes its own state on
//! the Daqonite state bus.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: one CLB receiver on 56015, output under ./data
//! daqonite
//!
//! # Explicit ports and an accelerator trigger endpoint
//! daqonite --clb-port 57001 --clb-port 57002 --trigger-port 56060
//!
//! # Full configuration from a file
//! daqonite --config daqonite.json
//! ```

mod config;
mod handler;

use chips_daq::bus::{BusPublisher, CommandHandler, CommandReceiver, StateSource};
use clap::Parser;
use config::DaqoniteConfig;
use handler::DaqHandler;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// CHIPS DAQ daemon.
#[derive(Parser, Debug)]
#[command(name = "daqonite")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CLB optical port (repeatable); overrides the config file
    #[arg(long = "clb-port")]
    clb_ports: Vec<u16>,

    /// BBB optical port (repeatable); overrides the config file
    #[arg(long = "bbb-port")]
    bbb_ports: Vec<u16>,

    /// Output directory for run files
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Accelerator trigger endpoint port (enables the externally
    /// triggered scheduler for data runs)
    #[arg(long)]
    trigger_port: Option<u16>,

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

    let mut config = match &args.config {
        Some(path) => DaqoniteConfig::from_file(path)?,
        None => DaqoniteConfig::default(),
    };
    if !args.clb_ports.is_empty() {
        config.clb_ports = args.clb_ports.clone();
    }
    if !args.bbb_ports.is_empty() {
        config.bbb_ports = args.bbb_ports.clone();
    }
    if let Some(output) = &args.output {
        config.output_directory = output.clone();
    }
    if args.trigger_port.is_some() {
        config.trigger_port = args.trigger_port;
    }

    let control_bus = config.control_bus_url()?;
    let state_bus = config.state_bus_url()?;

    tracing::info!(
        clb_ports = ?config.clb_ports,
        bbb_ports = ?config.bbb_ports,
        output = %config.output_directory.display(),
        "daqonite starting"
    );

    let handler = DaqHandler::new(config)?;

    let commands =
        CommandReceiver::start(control_bus, Arc::clone(&handler) as Arc<dyn CommandHandler>);
    let state = BusPublisher::start(state_bus, Arc::clone(&handler) as Arc<dyn StateSource>);

    let signal_handler = Arc::clone(&handler);
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt, terminating");
        signal_handler.handle_exit();
    })?;

    handler.wait_until_terminated();

    state.stop();
    commands.stop();
    handler.shutdown();

    tracing::info!("daqonite finished");
    Ok(())
}
