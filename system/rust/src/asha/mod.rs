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

//! ASHA (Audio Streaming for Hearing Aids) central role.
//!
//! [`SessionController`] owns the known hearing aids and drives each of
//! them from a GATT connection to a streaming L2CAP channel, keeps the two
//! members of a binaural pair informed of each other, and encodes and paces
//! the audio sent to them. It is single threaded: public calls and all
//! completion events must be delivered on the same thread, normally through
//! [`do_in_asha_thread`](crate::do_in_asha_thread).

use crate::core::uuid::Uuid;

pub mod codec;
pub mod config;
mod connection;
pub mod device;
pub mod events;
pub mod ids;
pub mod interfaces;
mod pipeline;
pub mod registry;
pub mod session;
mod stereo;
pub mod storage;
pub mod wire;

#[cfg(test)]
pub(crate) mod mock;

pub use pipeline::DROP_COOLDOWN;
pub use session::SessionController;

/// ASHA primary service.
pub const HEARING_AID_UUID: Uuid = Uuid::from_16bit(0xfdf0);
pub const READ_ONLY_PROPERTIES_UUID: Uuid = Uuid::from_u128(0x6333651e_c481_4a3e_9169_7c902aad37bb);
pub const AUDIO_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0xf0d4de7e_4a88_476c_9d9f_1937b0996cc0);
pub const AUDIO_STATUS_UUID: Uuid = Uuid::from_u128(0x38663f1a_e711_4cac_b641_326b56404837);
pub const VOLUME_UUID: Uuid = Uuid::from_u128(0x00e4ca9e_ab14_41e4_8823_f9e70c7e91df);
pub const LE_PSM_UUID: Uuid = Uuid::from_u128(0x2d410339_82b6_42aa_b34e_e2e01df8cc1a);

/// Generic Attribute service and its service changed characteristic.
pub const GATT_SERVICE_UUID: Uuid = Uuid::from_16bit(0x1801);
pub const SERVICE_CHANGED_UUID: Uuid = Uuid::from_16bit(0x2a05);
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = Uuid::from_16bit(0x2902);

/// Volume sentinel meaning "never set".
pub const VOLUME_UNKNOWN: i8 = 127;
/// Volume sent in START while it is unknown.
pub const VOLUME_MIN: i8 = -127;

/// Buffering added to the peer's render delay, in audio intervals.
pub const ADD_RENDER_DELAY_INTERVALS: u16 = 4;

/// Receive MTU and MPS of the audio channel.
pub const L2CAP_MTU: u16 = 512;
pub const L2CAP_MPS: u16 = 514;
/// LE data length requested after connecting.
pub const BLE_DATA_LENGTH: u16 = 167;

/// Connection event length, in 0.625 ms units.
pub const MIN_CE_LEN_10MS_CI: u16 = 0x0006;
pub const MIN_CE_LEN_20MS_CI: u16 = 0x000c;
pub const MAX_CE_LEN_20MS_CI: u16 = 0x000c;
pub const CE_LEN_20MS_CI_ISO_RUNNING: u16 = 0x0000;
/// Connection intervals, in 1.25 ms units.
pub const CONNECTION_INTERVAL_10MS_PARAM: u16 = 0x0008;
pub const CONNECTION_INTERVAL_20MS_PARAM: u16 = 0x0010;
pub const CONNECTION_LATENCY: u16 = 0x000a;
/// 1 s, in 10 ms units.
pub const SUPERVISION_TIMEOUT: u16 = 0x0064;
