// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Data run lifecycle.
//!
//! A run is a contiguous data-taking session of one type with one output
//! file. [`DataRun`] aggregates its metadata; [`RunNumberStore`] keeps the
//! per-type run counters persistent across restarts.

mod file;

pub use file::{
    FormatError, OptHitRow, RunFile, RunFileContents, RunFileReader, RunParamsRow, SpillRow,
};

use crate::time::UtcTimestamp;
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// The type of a data-taking run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunType {
    DataNormal = 1,
    Calibration = 2,
    TestNormal = 3,
    TestFlasher = 4,
}

impl RunType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::DataNormal),
            2 => Some(Self::Calibration),
            3 => Some(Self::TestNormal),
            4 => Some(Self::TestFlasher),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DataNormal => "DataNormal",
            Self::Calibration => "Calibration",
            Self::TestNormal => "TestNormal",
            Self::TestFlasher => "TestFlasher",
        }
    }

    /// Test runs take data without an accelerator, so they get the
    /// infinite scheduler by default.
    pub fn is_test(self) -> bool {
        matches!(self, Self::TestNormal | Self::TestFlasher)
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The scheduler variant chosen for a run. Descriptive only; the daemon
/// owns the actual scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Infinite,
    Periodic,
    ExternallyTriggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    NotStarted,
    Running,
    Stopped,
}

/// Metadata and lifecycle of one run. Created on StartRun, frozen on
/// StopRun.
#[derive(Debug)]
pub struct DataRun {
    number: u64,
    run_type: RunType,
    scheduler: SchedulerKind,
    output_path: PathBuf,
    state: Mutex<TimedState>,
}

#[derive(Debug)]
struct TimedState {
    state: RunState,
    time_started: UtcTimestamp,
    time_stopped: UtcTimestamp,
}

impl DataRun {
    pub fn new(
        number: u64,
        run_type: RunType,
        scheduler: SchedulerKind,
        output_directory: &Path,
    ) -> Self {
        let output_path =
            output_directory.join(format!("run_{:08}_{}.chips", number, run_type.name()));
        Self {
            number,
            run_type,
            scheduler,
            output_path,
            state: Mutex::new(TimedState {
                state: RunState::NotStarted,
                time_started: UtcTimestamp::default(),
                time_stopped: UtcTimestamp::default(),
            }),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn run_type(&self) -> RunType {
        self.run_type
    }

    pub fn scheduler_kind(&self) -> SchedulerKind {
        self.scheduler
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Stamp the start time. Idempotent after the first call.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.state == RunState::NotStarted {
            state.state = RunState::Running;
            state.time_started = UtcTimestamp::now();
        }
    }

    /// Stamp the stop time and freeze the run.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.state == RunState::Running {
            state.state = RunState::Stopped;
            state.time_stopped = UtcTimestamp::now();
        }
    }

    pub fn time_started(&self) -> UtcTimestamp {
        self.state.lock().time_started
    }

    pub fn time_stopped(&self) -> UtcTimestamp {
        self.state.lock().time_stopped
    }

    /// One-line description for log output.
    pub fn log_description(&self) -> String {
        let state = self.state.lock();
        match state.state {
            RunState::NotStarted => {
                format!("[number = {}, type = {}, state = not_started]", self.number, self.run_type)
            }
            RunState::Running => format!(
                "[number = {}, type = {}, state = running, start_time = {}]",
                self.number, self.run_type, state.time_started
            ),
            RunState::Stopped => format!(
                "[number = {}, type = {}, state = stopped, start_time = {}, stop_time = {}]",
                self.number, self.run_type, state.time_started, state.time_stopped
            ),
        }
    }
}

/// Persistent per-type run counters, kept in a small text file next to the
/// run output (`<line> = "<type_code> <next_number>"`).
#[derive(Debug)]
pub struct RunNumberStore {
    path: PathBuf,
}

impl RunNumberStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Allocate the next run number of `run_type`, advancing the stored
    /// counter.
    pub fn next_run_number(&self, run_type: RunType) -> std::io::Result<u64> {
        let mut counters = self.read_counters()?;
        let number = counters
            .iter()
            .find(|(code, _)| *code == run_type.code())
            .map_or(1, |(_, n)| *n);

        match counters.iter_mut().find(|(code, _)| *code == run_type.code()) {
            Some(entry) => entry.1 = number + 1,
            None => counters.push((run_type.code(), number + 1)),
        }
        self.write_counters(&counters)?;

        Ok(number)
    }

    fn read_counters(&self) -> std::io::Result<Vec<(u8, u64)>> {
        let mut contents = String::new();
        match std::fs::File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_string(&mut contents)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        Ok(contents
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let code = parts.next()?.parse().ok()?;
                let number = parts.next()?.parse().ok()?;
                Some((code, number))
            })
            .collect())
    }

    fn write_counters(&self, counters: &[(u8, u64)]) -> std::io::Result<()> {
        let mut file = std::fs::File::create(&self.path)?;
        for (code, number) in counters {
            writeln!(file, "{} {}", code, number)?;
        }
        Ok(())
    }
}
