// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ASHA on-air formats: audio control point commands, the read-only
//! properties characteristic, the PSM characteristic and audio packets.
//! Everything is little-endian.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use super::device::Capabilities;

/// Audio control point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ControlPointOpcode {
    Start = 0x01,
    Stop = 0x02,
    StateChange = 0x03,
}

/// Sub-opcodes of [`ControlPointOpcode::StateChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    OtherSideDisconnected,
    OtherSideConnected,
    ConnectionUpdate { interval: u8 },
}

impl StateChange {
    fn sub_opcode(&self) -> u8 {
        match self {
            StateChange::OtherSideDisconnected => 0x00,
            StateChange::OtherSideConnected => 0x01,
            StateChange::ConnectionUpdate { .. } => 0x02,
        }
    }
}

/// Whether the other side of the pair is currently streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum OtherSideStatus {
    NotStreaming = 0x00,
    Streaming = 0x01,
}

/// Audio type field of START; only "unknown" is ever sent.
pub const AUDIOTYPE_UNKNOWN: u8 = 0x00;

/// A write to the audio control point characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPointCommand {
    Start { codec: u8, audio_type: u8, volume: i8, other_side: OtherSideStatus },
    Stop,
    StateChange(StateChange),
}

impl ControlPointCommand {
    pub fn opcode(&self) -> ControlPointOpcode {
        match self {
            ControlPointCommand::Start { .. } => ControlPointOpcode::Start,
            ControlPointCommand::Stop => ControlPointOpcode::Stop,
            ControlPointCommand::StateChange(_) => ControlPointOpcode::StateChange,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.opcode() as u8);
        match self {
            ControlPointCommand::Start { codec, audio_type, volume, other_side } => {
                buf.put_u8(*codec);
                buf.put_u8(*audio_type);
                buf.put_i8(*volume);
                buf.put_u8(*other_side as u8);
            }
            ControlPointCommand::Stop => {}
            ControlPointCommand::StateChange(change) => {
                buf.put_u8(change.sub_opcode());
                if let StateChange::ConnectionUpdate { interval } = change {
                    buf.put_u8(*interval);
                }
            }
        }
        buf.to_vec()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self, ParseError> {
        if data.is_empty() {
            return Err(ParseError::TooShort { expected: 1, actual: 0 });
        }
        let opcode = data.get_u8();
        match ControlPointOpcode::from_u8(opcode) {
            Some(ControlPointOpcode::Start) => {
                ensure_len(data, 4, 5)?;
                Ok(ControlPointCommand::Start {
                    codec: data.get_u8(),
                    audio_type: data.get_u8(),
                    volume: data.get_i8(),
                    other_side: OtherSideStatus::from_u8(data.get_u8())
                        .unwrap_or(OtherSideStatus::NotStreaming),
                })
            }
            Some(ControlPointOpcode::Stop) => Ok(ControlPointCommand::Stop),
            Some(ControlPointOpcode::StateChange) => {
                ensure_len(data, 1, 2)?;
                let change = match data.get_u8() {
                    0x00 => StateChange::OtherSideDisconnected,
                    0x01 => StateChange::OtherSideConnected,
                    0x02 => {
                        ensure_len(data, 1, 3)?;
                        StateChange::ConnectionUpdate { interval: data.get_u8() }
                    }
                    other => return Err(ParseError::UnknownOpcode(other)),
                };
                Ok(ControlPointCommand::StateChange(change))
            }
            None => Err(ParseError::UnknownOpcode(opcode)),
        }
    }
}

/// Failure to decode one of the ASHA payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    TooShort { expected: usize, actual: usize },
    UnsupportedVersion(u8),
    UnknownOpcode(u8),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort { expected, actual } => {
                write!(f, "invalid data length (expected {expected}+ bytes, got {actual})")
            }
            ParseError::UnsupportedVersion(v) => write!(f, "unsupported version 0x{v:x}"),
            ParseError::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:x}"),
        }
    }
}

impl std::error::Error for ParseError {}

fn ensure_len(remaining: &[u8], needed: usize, total: usize) -> Result<(), ParseError> {
    if remaining.len() < needed {
        return Err(ParseError::TooShort {
            expected: total,
            actual: total - needed + remaining.len(),
        });
    }
    Ok(())
}

/// Contents of the read-only properties characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOnlyProperties {
    pub capabilities: Capabilities,
    pub hi_sync_id: u64,
    pub feature_map: u8,
    pub render_delay: u16,
    pub preparation_delay: u16,
    pub codecs: u16,
}

impl ReadOnlyProperties {
    pub const VERSION: u8 = 0x01;
    pub const LEN: usize = 17;

    /// Decodes a version 1 payload. Bytes beyond the 17th are ignored.
    pub fn parse(mut data: &[u8]) -> Result<Self, ParseError> {
        let len = data.len();
        if len == 0 {
            return Err(ParseError::TooShort { expected: Self::LEN, actual: 0 });
        }
        let version = data.get_u8();
        if version != Self::VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }
        if len < Self::LEN {
            return Err(ParseError::TooShort { expected: Self::LEN, actual: len });
        }
        Ok(Self {
            capabilities: Capabilities::from_bits_retain(data.get_u8()),
            hi_sync_id: data.get_u64_le(),
            feature_map: data.get_u8(),
            render_delay: data.get_u16_le(),
            preparation_delay: data.get_u16_le(),
            codecs: data.get_u16_le(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u8(Self::VERSION);
        buf.put_u8(self.capabilities.bits());
        buf.put_u64_le(self.hi_sync_id);
        buf.put_u8(self.feature_map);
        buf.put_u16_le(self.render_delay);
        buf.put_u16_le(self.preparation_delay);
        buf.put_u16_le(self.codecs);
        buf.to_vec()
    }
}

/// Decodes the LE_PSM_OUT characteristic.
pub fn parse_psm(mut data: &[u8]) -> Result<u16, ParseError> {
    if data.len() < 2 {
        return Err(ParseError::TooShort { expected: 2, actual: data.len() });
    }
    Ok(data.get_u16_le())
}

/// Client characteristic configuration values.
pub const CCC_NOTIFICATION: u16 = 0x0001;
pub const CCC_INDICATION: u16 = 0x0002;

pub fn ccc_value(value: u16) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Builds one L2CAP SDU: `[sequence][payload]`.
pub fn audio_packet(sequence: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_u8(sequence);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Statistics record sent back by a hearing aid on the audio channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    pub event_counter: u16,
    pub frame_index: u16,
}

/// Splits a channel read into 4-byte stats records; trailing bytes are
/// ignored.
pub fn parse_peer_stats(mut data: &[u8]) -> Vec<PeerStats> {
    let mut stats = Vec::with_capacity(data.len() / 4);
    while data.remaining() >= 4 {
        stats.push(PeerStats { event_counter: data.get_u16_le(), frame_index: data.get_u16_le() });
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asha::codec::CodecId;

    #[test]
    fn start_layout() {
        let start = ControlPointCommand::Start {
            codec: CodecId::G722At16Khz as u8,
            audio_type: AUDIOTYPE_UNKNOWN,
            volume: -127,
            other_side: OtherSideStatus::Streaming,
        };
        assert_eq!(start.to_bytes(), vec![0x01, 0x01, 0x00, 0x81, 0x01]);
        assert_eq!(ControlPointCommand::from_bytes(&start.to_bytes()), Ok(start));
    }

    #[test]
    fn stop_and_state_change_layout() {
        assert_eq!(ControlPointCommand::Stop.to_bytes(), vec![0x02]);
        assert_eq!(
            ControlPointCommand::StateChange(StateChange::OtherSideConnected).to_bytes(),
            vec![0x03, 0x01]
        );
        assert_eq!(
            ControlPointCommand::StateChange(StateChange::ConnectionUpdate { interval: 16 })
                .to_bytes(),
            vec![0x03, 0x02, 0x10]
        );
    }

    #[test]
    fn truncated_commands() {
        assert_eq!(
            ControlPointCommand::from_bytes(&[0x01, 0x01]),
            Err(ParseError::TooShort { expected: 5, actual: 2 })
        );
        assert_eq!(
            ControlPointCommand::from_bytes(&[0x03, 0x02]),
            Err(ParseError::TooShort { expected: 3, actual: 2 })
        );
        assert_eq!(ControlPointCommand::from_bytes(&[0x09]), Err(ParseError::UnknownOpcode(9)));
    }

    #[test]
    fn read_only_properties_reproduce_their_fields() {
        let props = ReadOnlyProperties {
            capabilities: Capabilities::SIDE | Capabilities::BINAURAL,
            hi_sync_id: 0x0102_0304_0506_0708,
            feature_map: 0x01,
            render_delay: 40,
            preparation_delay: 10,
            codecs: 0b0110,
        };
        let bytes = props.to_bytes();
        assert_eq!(bytes.len(), ReadOnlyProperties::LEN);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[2..10], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(ReadOnlyProperties::parse(&bytes), Ok(props));
    }

    #[test]
    fn read_only_properties_errors() {
        assert_eq!(
            ReadOnlyProperties::parse(&[]),
            Err(ParseError::TooShort { expected: 17, actual: 0 })
        );
        let mut bytes = vec![0u8; 17];
        bytes[0] = 0x02;
        assert_eq!(ReadOnlyProperties::parse(&bytes), Err(ParseError::UnsupportedVersion(2)));
        assert_eq!(
            ReadOnlyProperties::parse(&[0x01, 0x00, 0x00]),
            Err(ParseError::TooShort { expected: 17, actual: 3 })
        );
    }

    #[test]
    fn psm_and_stats() {
        assert_eq!(parse_psm(&[0x81, 0x00]), Ok(0x0081));
        assert!(parse_psm(&[0x81]).is_err());
        assert_eq!(
            parse_peer_stats(&[0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00, 0xff]),
            vec![
                PeerStats { event_counter: 1, frame_index: 2 },
                PeerStats { event_counter: 3, frame_index: 4 }
            ]
        );
        assert_eq!(audio_packet(7, &[1, 2]), vec![7, 1, 2]);
    }
}
