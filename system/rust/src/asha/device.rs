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

//! Per-peripheral state tracked by the session.

use std::collections::VecDeque;
use std::time::SystemTime;

use bitflags::bitflags;

use super::ids::{AttHandle, ConnId, GapHandle};
use crate::core::address::RawAddress;

bitflags! {
    /// The capability byte of the read-only properties characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u8 {
        /// Set for the right ear, clear for the left.
        const SIDE = 0x01;
        const BINAURAL = 0x02;
        const CSIS = 0x04;
        const RESERVED = 0xf8;
    }
}

impl Capabilities {
    pub fn side(&self) -> Side {
        if self.contains(Capabilities::SIDE) {
            Side::Right
        } else {
            Side::Left
        }
    }

    pub fn has_reserved_bits(&self) -> bool {
        self.intersects(Capabilities::RESERVED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn name(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Progress of the BLE connection interval negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionUpdateStatus {
    #[default]
    None,
    Started,
    /// A conflicting update must be redone once the in-flight one completes.
    Awaiting,
    Completed,
}

/// Lifecycle of one device. Failures and disconnects return to
/// `Disconnected` from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    GattConnecting,
    Encrypting,
    ServiceDiscovery,
    CharacteristicResolution,
    SocketOpening,
    ConnParamNegotiation,
    Ready,
    Streaming,
}

/// Number of RSSI reads issued after each flush event.
pub const READ_RSSI_NUM_TRIES: i32 = 10;
/// Audio intervals between two RSSI reads of a single device.
pub const PERIOD_TO_READ_RSSI_IN_INTERVALS: i32 = 5;
/// Number of RSSI batches kept per device.
pub const MAX_RSSI_HISTORY: usize = 15;
/// Attempts at switching to the 2M PHY after an unexpected PHY update.
pub const PHY_UPDATE_RETRY_LIMIT: u8 = 2;

/// One batch of RSSI samples, started by a flush event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssiLog {
    /// Wall clock time of the first sample in the batch.
    pub timestamp: Option<SystemTime>,
    pub rssi: Vec<i8>,
}

#[derive(Debug, Clone, Default)]
pub struct AudioStats {
    pub trigger_drop_count: usize,
    pub packet_drop_count: usize,
    pub packet_send_count: usize,
    pub packet_flush_count: usize,
    pub frame_send_count: usize,
    pub frame_flush_count: usize,
    pub rssi_history: VecDeque<RssiLog>,
}

/// The values persisted once a device completed its first connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoredProperties {
    pub capabilities: Capabilities,
    pub hi_sync_id: u64,
    pub render_delay: u16,
    pub preparation_delay: u16,
    pub codecs: u16,
}

/// GATT attribute handles cached between connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GattHandles {
    pub audio_control_point: AttHandle,
    pub audio_status: AttHandle,
    pub audio_status_ccc: AttHandle,
    pub volume: AttHandle,
    pub read_psm: AttHandle,
    pub service_changed_ccc: AttHandle,
}

impl GattHandles {
    /// True when the five ASHA handles are known, which allows skipping
    /// service discovery.
    pub fn all_resolved(&self) -> bool {
        self.audio_control_point.is_resolved()
            && self.audio_status.is_resolved()
            && self.audio_status_ccc.is_resolved()
            && self.volume.is_resolved()
            && self.read_psm.is_resolved()
    }
}

/// A known hearing aid and its connection state.
#[derive(Debug, Clone)]
pub struct HearingDevice {
    pub address: RawAddress,
    pub hi_sync_id: u64,
    pub capabilities: Capabilities,
    pub codecs: u16,
    pub render_delay: u16,
    pub preparation_delay: u16,
    pub handles: GattHandles,

    pub conn_id: ConnId,
    pub gap_handle: GapHandle,
    pub(crate) state: ConnectionState,

    pub first_connection: bool,
    pub connecting_actively: bool,
    pub switch_to_background_after_failure: bool,
    pub service_changed_rcvd: bool,
    pub accepting_audio: bool,
    pub playback_started: bool,
    pub command_acked: bool,
    pub gap_opened: bool,

    pub connection_update_status: ConnectionUpdateStatus,
    pub requested_connection_interval: u16,
    pub phy_update_retry_remain: u8,

    pub audio_stats: AudioStats,
    pub read_rssi_count: i32,
    pub num_intervals_since_last_rssi_read: i32,
}

impl HearingDevice {
    /// A device named by a connect request, properties still unknown.
    pub fn new(address: RawAddress, first_connection: bool) -> Self {
        Self {
            address,
            hi_sync_id: 0,
            capabilities: Capabilities::empty(),
            codecs: 0,
            render_delay: 0,
            preparation_delay: 0,
            handles: GattHandles::default(),
            conn_id: ConnId::NONE,
            gap_handle: GapHandle::INVALID,
            state: ConnectionState::Disconnected,
            first_connection,
            connecting_actively: false,
            switch_to_background_after_failure: false,
            service_changed_rcvd: false,
            accepting_audio: false,
            playback_started: false,
            command_acked: false,
            gap_opened: false,
            connection_update_status: ConnectionUpdateStatus::None,
            requested_connection_interval: 0,
            phy_update_retry_remain: PHY_UPDATE_RETRY_LIMIT,
            audio_stats: AudioStats::default(),
            read_rssi_count: 0,
            num_intervals_since_last_rssi_read: 0,
        }
    }

    /// A device reloaded from pairing storage, with its cached handles.
    pub fn from_storage(
        address: RawAddress,
        properties: StoredProperties,
        handles: GattHandles,
    ) -> Self {
        Self {
            hi_sync_id: properties.hi_sync_id,
            capabilities: properties.capabilities,
            codecs: properties.codecs,
            render_delay: properties.render_delay,
            preparation_delay: properties.preparation_delay,
            handles,
            ..Self::new(address, false)
        }
    }

    pub fn side(&self) -> Side {
        self.capabilities.side()
    }

    pub fn is_left(&self) -> bool {
        self.side() == Side::Left
    }

    pub fn stored_properties(&self) -> StoredProperties {
        StoredProperties {
            capabilities: self.capabilities,
            hi_sync_id: self.hi_sync_id,
            render_delay: self.render_delay,
            preparation_delay: self.preparation_delay,
            codecs: self.codecs,
        }
    }

    pub fn apply_properties(&mut self, properties: StoredProperties) {
        self.capabilities = properties.capabilities;
        self.hi_sync_id = properties.hi_sync_id;
        self.render_delay = properties.render_delay;
        self.preparation_delay = properties.preparation_delay;
        self.codecs = properties.codecs;
    }

    /// Streaming once the START round trip completed in both directions.
    pub fn state(&self) -> ConnectionState {
        if self.accepting_audio && self.playback_started && self.command_acked {
            ConnectionState::Streaming
        } else {
            self.state
        }
    }

    /// Both halves of the START handshake are done.
    pub fn can_stream(&self) -> bool {
        self.playback_started && self.command_acked
    }
}
