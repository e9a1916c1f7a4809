// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Daemon configuration.

use chips_daq::bus::BusUrl;
use chips_daq::config as defaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daqonite configuration, loadable from a JSON file and overridable from
/// the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqoniteConfig {
    /// CLB optical ports, one receiver each.
    #[serde(default = "default_clb_ports")]
    pub clb_ports: Vec<u16>,

    /// BBB optical ports, one receiver each.
    #[serde(default)]
    pub bbb_ports: Vec<u16>,

    /// Directory receiving run files and the run-number ledger.
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    /// Control command bus to subscribe to.
    #[serde(default = "default_control_bus")]
    pub control_bus: String,

    /// State bus to publish on.
    #[serde(default = "default_state_bus")]
    pub state_bus: String,

    /// Port of the embedded accelerator-trigger endpoint; `None` selects
    /// the periodic scheduler for non-test runs.
    #[serde(default)]
    pub trigger_port: Option<u16>,

    /// Periodic spill duration in milliseconds.
    #[serde(default = "default_spill_duration_ms")]
    pub spill_duration_ms: u64,

    /// Initial trigger-period guess in seconds, until the predictor has
    /// learned a real interval.
    #[serde(default = "default_trigger_period_guess")]
    pub trigger_period_guess_secs: f64,
}

fn default_clb_ports() -> Vec<u16> {
    vec![defaults::CLB_OPTICAL_PORT]
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./data")
}

fn default_control_bus() -> String {
    defaults::CONTROL_BUS_URL.to_owned()
}

fn default_state_bus() -> String {
    defaults::DAQONITE_BUS_URL.to_owned()
}

fn default_spill_duration_ms() -> u64 {
    defaults::SPILL_DURATION.as_millis() as u64
}

fn default_trigger_period_guess() -> f64 {
    1.33
}

impl Default for DaqoniteConfig {
    fn default() -> Self {
        Self {
            clb_ports: default_clb_ports(),
            bbb_ports: Vec::new(),
            output_directory: default_output_directory(),
            control_bus: default_control_bus(),
            state_bus: default_state_bus(),
            trigger_port: None,
            spill_duration_ms: default_spill_duration_ms(),
            trigger_period_guess_secs: default_trigger_period_guess(),
        }
    }
}

impl DaqoniteConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn control_bus_url(&self) -> anyhow::Result<BusUrl> {
        Ok(self.control_bus.parse()?)
    }

    pub fn state_bus_url(&self) -> anyhow::Result<BusUrl> {
        Ok(self.state_bus.parse()?)
    }
}
