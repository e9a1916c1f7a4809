// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! ops_cmd - send one operator command to the experiment supervisor.
//!
//! ```text
//! ops_cmd <bus-url> [ config <file> | startData | stopData | startRun N | stopRun | exit ]
//! ```
//!
//! Exit codes: 0 = acknowledged, 1 = bad arguments, 2 = unknown command,
//! 3 = NAK, 4 = communication error.

use chips_daq::bus::{BusUrl, OpsMessage, ReqSocket};
use chips_daq::run::RunType;
use std::process::ExitCode;
use std::time::Duration;

const REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

const EXIT_SUCCESS: u8 = 0;
const EXIT_BAD_ARGS: u8 = 1;
const EXIT_UNKNOWN_COMMAND: u8 = 2;
const EXIT_NAK: u8 = 3;
const EXIT_COMM_ERROR: u8 = 4;

fn usage(program: &str) {
    eprintln!(
        "usage: {} ops_bus_url [ config <opt file> | startData | stopData | startRun N | stopRun | exit ]",
        program
    );
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map_or("ops_cmd", String::as_str);

    if args.len() < 3 || args.len() > 4 {
        usage(program);
        return ExitCode::from(EXIT_BAD_ARGS);
    }

    let bus_url: BusUrl = match args[1].parse() {
        Ok(url) => url,
        Err(err) => {
            eprintln!("{}: {}", program, err);
            return ExitCode::from(EXIT_BAD_ARGS);
        }
    };

    // Construct the message.
    let message = match args[2].as_str() {
        "config" => {
            if args.len() != 4 {
                eprintln!("{}: expected a config file", program);
                return ExitCode::from(EXIT_BAD_ARGS);
            }
            OpsMessage::Config { path: args[3].clone() }
        }
        "startData" => OpsMessage::StartData,
        "stopData" => OpsMessage::StopData,
        "startRun" => {
            if args.len() != 4 {
                eprintln!("{}: expected a run type [1-4]", program);
                return ExitCode::from(EXIT_BAD_ARGS);
            }
            let Some(run_type) = args[3].parse().ok().and_then(RunType::from_code) else {
                eprintln!("{}: expected a run type between [1-4]", program);
                return ExitCode::from(EXIT_BAD_ARGS);
            };
            OpsMessage::StartRun { run_type }
        }
        "stopRun" => OpsMessage::StopRun,
        "exit" => OpsMessage::Exit,
        _ => {
            eprintln!("{}: expected a valid command", program);
            return ExitCode::from(EXIT_UNKNOWN_COMMAND);
        }
    };

    // Send it and wait for the ACK.
    let socket = match ReqSocket::open(bus_url, REPLY_TIMEOUT) {
        Ok(socket) => socket,
        Err(err) => {
            eprintln!("{}: {}", program, err);
            return ExitCode::from(EXIT_COMM_ERROR);
        }
    };

    let mut reply = [0u8; 1];
    match socket.request(&message.encode(), &mut reply) {
        Ok(size) if size >= 1 && reply[0] != 0 => ExitCode::from(EXIT_SUCCESS),
        Ok(_) => {
            eprintln!("{}: received NAK", program);
            ExitCode::from(EXIT_NAK)
        }
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
            eprintln!("{}: connection refused, is the FSM running?", program);
            ExitCode::from(EXIT_COMM_ERROR)
        }
        Err(err) => {
            eprintln!("{}: {}", program, err);
            ExitCode::from(EXIT_COMM_ERROR)
        }
    }
}
