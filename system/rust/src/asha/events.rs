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

//! Completions and indications delivered to the session. Each variant is
//! consumed by [`SessionController::handle_event`](super::session::SessionController::handle_event).

use std::fmt;

use super::ids::{AttHandle, ConnId, GapHandle};
use super::interfaces::{GattRequest, GattStatus, Phy};
use crate::core::address::RawAddress;

/// Largest attribute value accepted in a notification.
pub const GATT_MAX_ATTR_LEN: usize = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Open { status: GattStatus, conn_id: ConnId, address: RawAddress, mtu: u16 },
    Close { conn_id: ConnId, address: RawAddress },
    SearchComplete { conn_id: ConnId, status: GattStatus },
    Notification { conn_id: ConnId, handle: AttHandle, value: Vec<u8>, is_notify: bool },
    /// `interval` is in 1.25 ms units.
    ConnectionUpdate { conn_id: ConnId, status: GattStatus, interval: u16 },
    ServiceChanged { address: RawAddress },
    ServiceDiscoveryDone { address: RawAddress },
    PhyUpdate { conn_id: ConnId, tx_phy: Phy, rx_phy: Phy, status: GattStatus },
    ReadComplete {
        conn_id: ConnId,
        status: GattStatus,
        handle: AttHandle,
        value: Vec<u8>,
        request: GattRequest,
    },
    WriteComplete { conn_id: ConnId, status: GattStatus, handle: AttHandle, request: GattRequest },
}

/// Events of one credit-based channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapEvent {
    Opened,
    Closed,
    DataAvailable,
    TxEmpty,
    Congested,
    Uncongested,
}

/// Starts or stops the audio source's frame ticks.
pub type TicksCallback = Box<dyn FnOnce() + Send>;

pub enum AudioEvent {
    /// One frame of interleaved 16-bit little-endian stereo PCM.
    DataReady(Vec<u8>),
    Suspend(TicksCallback),
    Resume(TicksCallback),
}

impl fmt::Debug for AudioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioEvent::DataReady(data) => write!(f, "DataReady({} bytes)", data.len()),
            AudioEvent::Suspend(_) => write!(f, "Suspend"),
            AudioEvent::Resume(_) => write!(f, "Resume"),
        }
    }
}

#[derive(Debug)]
pub enum AshaEvent {
    Gatt(GattEvent),
    Gap { gap_handle: GapHandle, event: GapEvent },
    Encryption { address: RawAddress, success: bool },
    IsoTrafficActive(bool),
    /// `None` when the read failed.
    RssiRead { address: RawAddress, rssi: Option<i8> },
    Audio(AudioEvent),
}

impl From<GattEvent> for AshaEvent {
    fn from(event: GattEvent) -> Self {
        AshaEvent::Gatt(event)
    }
}

impl From<AudioEvent> for AshaEvent {
    fn from(event: AudioEvent) -> Self {
        AshaEvent::Audio(event)
    }
}
