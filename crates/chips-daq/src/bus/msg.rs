// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! Control-plane message codecs.
//!
//! Fixed-layout discriminated unions. Operator requests travel bare
//! (`disc:u8` + payload); broadcast messages carry a leading NUL byte so
//! subscribers with an empty topic filter accept them:
//!
//! ```text
//! OpsMessage:          disc:u8  payload
//! ControlMessage:      0x00  disc:u8  payload
//! participant states:  0x00  disc:u8  optional payload
//! ```
//!
//! `Config` carries its path length-prefixed (`u16` LE); `StartRun` and
//! `Daqonite::Running` carry the run type code. Unknown discriminators are
//! decode errors, answered with NAK or logged by the receiving side.

use crate::run::RunType;
use thiserror::Error;

/// Message decode errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,

    #[error("unknown discriminator {0}")]
    UnknownDiscriminator(u8),

    #[error("missing leading NUL byte")]
    MissingNul,

    #[error("invalid run type code {0}")]
    InvalidRunType(u8),

    #[error("malformed payload")]
    BadPayload,
}

/// An operator request on the uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpsMessage {
    /// Configure from config files.
    Config { path: String },
    /// Start data flow.
    StartData,
    /// Stop data flow.
    StopData,
    /// Start a new data-taking run.
    StartRun { run_type: RunType },
    /// Stop the current run.
    StopRun,
    /// Exit, possibly stopping the current run.
    Exit,
}

impl OpsMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::new();
        encode_command(self, &mut wire);
        wire
    }

    pub fn decode(wire: &[u8]) -> Result<Self, DecodeError> {
        decode_command(wire)
    }
}

/// A run-lifecycle command broadcast by the supervisor.
///
/// The same union as [`OpsMessage`], framed with the leading NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage(pub OpsMessage);

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = vec![0u8];
        encode_command(&self.0, &mut wire);
        wire
    }

    pub fn decode(wire: &[u8]) -> Result<Self, DecodeError> {
        let rest = strip_nul(wire)?;
        Ok(Self(decode_command(rest)?))
    }
}

fn encode_command(message: &OpsMessage, wire: &mut Vec<u8>) {
    match message {
        OpsMessage::Config { path } => {
            wire.push(0);
            let bytes = path.as_bytes();
            wire.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            wire.extend_from_slice(bytes);
        }
        OpsMessage::StartData => wire.push(1),
        OpsMessage::StopData => wire.push(2),
        OpsMessage::StartRun { run_type } => {
            wire.push(3);
            wire.push(run_type.code());
        }
        OpsMessage::StopRun => wire.push(4),
        OpsMessage::Exit => wire.push(5),
    }
}

fn decode_command(wire: &[u8]) -> Result<OpsMessage, DecodeError> {
    let (&disc, rest) = wire.split_first().ok_or(DecodeError::Truncated)?;
    match disc {
        0 => {
            if rest.len() < 2 {
                return Err(DecodeError::Truncated);
            }
            let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
            let bytes = rest.get(2..2 + len).ok_or(DecodeError::Truncated)?;
            let path = String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadPayload)?;
            Ok(OpsMessage::Config { path })
        }
        1 => Ok(OpsMessage::StartData),
        2 => Ok(OpsMessage::StopData),
        3 => {
            let &code = rest.first().ok_or(DecodeError::Truncated)?;
            let run_type = RunType::from_code(code).ok_or(DecodeError::InvalidRunType(code))?;
            Ok(OpsMessage::StartRun { run_type })
        }
        4 => Ok(OpsMessage::StopRun),
        5 => Ok(OpsMessage::Exit),
        other => Err(DecodeError::UnknownDiscriminator(other)),
    }
}

fn strip_nul(wire: &[u8]) -> Result<&[u8], DecodeError> {
    match wire.split_first() {
        Some((0, rest)) => Ok(rest),
        Some(_) => Err(DecodeError::MissingNul),
        None => Err(DecodeError::Truncated),
    }
}

/// Daqonite's published state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqoniteStateMessage {
    /// Alive but not taking data.
    Ready,
    /// Actively mining and saving data.
    Running { run_type: RunType },
}

impl DaqoniteStateMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Ready => vec![0, 0],
            Self::Running { run_type } => vec![0, 1, run_type.code()],
        }
    }

    pub fn decode(wire: &[u8]) -> Result<Self, DecodeError> {
        let rest = strip_nul(wire)?;
        let (&disc, rest) = rest.split_first().ok_or(DecodeError::Truncated)?;
        match disc {
            0 => Ok(Self::Ready),
            1 => {
                let &code = rest.first().ok_or(DecodeError::Truncated)?;
                let run_type = RunType::from_code(code).ok_or(DecodeError::InvalidRunType(code))?;
                Ok(Self::Running { run_type })
            }
            other => Err(DecodeError::UnknownDiscriminator(other)),
        }
    }
}

/// Daqontrol's published state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqontrolStateMessage {
    Initialising,
    Ready,
    Configured,
    Started,
}

impl DaqontrolStateMessage {
    pub fn encode(&self) -> Vec<u8> {
        let disc = match self {
            Self::Initialising => 0,
            Self::Ready => 1,
            Self::Configured => 2,
            Self::Started => 3,
        };
        vec![0, disc]
    }

    pub fn decode(wire: &[u8]) -> Result<Self, DecodeError> {
        let rest = strip_nul(wire)?;
        match rest.first().ok_or(DecodeError::Truncated)? {
            0 => Ok(Self::Initialising),
            1 => Ok(Self::Ready),
            2 => Ok(Self::Configured),
            3 => Ok(Self::Started),
            other => Err(DecodeError::UnknownDiscriminator(*other)),
        }
    }
}

/// Daqsitter's published state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqsitterStateMessage {
    Ready,
    Started,
}

impl DaqsitterStateMessage {
    pub fn encode(&self) -> Vec<u8> {
        let disc = match self {
            Self::Ready => 0,
            Self::Started => 1,
        };
        vec![0, disc]
    }

    pub fn decode(wire: &[u8]) -> Result<Self, DecodeError> {
        let rest = strip_nul(wire)?;
        match rest.first().ok_or(DecodeError::Truncated)? {
            0 => Ok(Self::Ready),
            1 => Ok(Self::Started),
            other => Err(DecodeError::UnknownDiscriminator(*other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops_message_roundtrip() {
        let messages = [
            OpsMessage::Config { path: "/etc/chips/daq.json".into() },
            OpsMessage::StartData,
            OpsMessage::StopData,
            OpsMessage::StartRun { run_type: RunType::Calibration },
            OpsMessage::StopRun,
            OpsMessage::Exit,
        ];
        for message in messages {
            let wire = message.encode();
            assert_eq!(OpsMessage::decode(&wire), Ok(message));
        }
    }

    #[test]
    fn test_ops_discriminators_match_the_wire_contract() {
        assert_eq!(OpsMessage::StartData.encode(), vec![1]);
        assert_eq!(OpsMessage::StopData.encode(), vec![2]);
        assert_eq!(
            OpsMessage::StartRun { run_type: RunType::DataNormal }.encode(),
            vec![3, 1]
        );
        assert_eq!(OpsMessage::StopRun.encode(), vec![4]);
        assert_eq!(OpsMessage::Exit.encode(), vec![5]);
    }

    #[test]
    fn test_control_message_leads_with_nul() {
        let message = ControlMessage(OpsMessage::StartRun { run_type: RunType::TestNormal });
        let wire = message.encode();
        assert_eq!(wire[0], 0);
        assert_eq!(ControlMessage::decode(&wire), Ok(message));

        assert_eq!(
            ControlMessage::decode(&[7, 1]),
            Err(DecodeError::MissingNul)
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(OpsMessage::decode(&[]), Err(DecodeError::Truncated));
        assert_eq!(OpsMessage::decode(&[9]), Err(DecodeError::UnknownDiscriminator(9)));
        assert_eq!(OpsMessage::decode(&[3, 0]), Err(DecodeError::InvalidRunType(0)));
        assert_eq!(OpsMessage::decode(&[3]), Err(DecodeError::Truncated));
        // Config whose declared length overruns the buffer.
        assert_eq!(OpsMessage::decode(&[0, 10, 0, b'x']), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_daqonite_state_roundtrip() {
        let wire = DaqoniteStateMessage::Running { run_type: RunType::TestFlasher }.encode();
        assert_eq!(wire, vec![0, 1, 4]);
        assert_eq!(
            DaqoniteStateMessage::decode(&wire),
            Ok(DaqoniteStateMessage::Running { run_type: RunType::TestFlasher })
        );
        assert_eq!(
            DaqoniteStateMessage::decode(&DaqoniteStateMessage::Ready.encode()),
            Ok(DaqoniteStateMessage::Ready)
        );
    }

    #[test]
    fn test_participant_state_roundtrips() {
        for state in [
            DaqontrolStateMessage::Initialising,
            DaqontrolStateMessage::Ready,
            DaqontrolStateMessage::Configured,
            DaqontrolStateMessage::Started,
        ] {
            assert_eq!(DaqontrolStateMessage::decode(&state.encode()), Ok(state));
        }
        for state in [DaqsitterStateMessage::Ready, DaqsitterStateMessage::Started] {
            assert_eq!(DaqsitterStateMessage::decode(&state.encode()), Ok(state));
        }
    }
}
