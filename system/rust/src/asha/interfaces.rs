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

//! The narrow interfaces to the rest of the stack. Every request made
//! through these is fire-and-forget: its outcome comes back later as an
//! [`AshaEvent`](super::events::AshaEvent).

use std::fmt;
use std::rc::Rc;

use super::codec::CodecConfiguration;
use super::device::{Capabilities, GattHandles, HearingDevice, Side, StoredProperties};
use super::ids::{AttHandle, ConnId, GapHandle, GattIf};
use crate::core::address::RawAddress;
use crate::core::uuid::Uuid;

/// Completion status reported by the GATT layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Error(u8),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        *self == GattStatus::Success
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Success => write!(f, "success"),
            GattStatus::Error(code) => write!(f, "0x{code:02x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Aggressive scan for this peer, user initiated.
    Direct,
    /// Passive acceptlist entry, connects when the peer advertises.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Identifies what a read or write was for. The GATT layer hands it back
/// unchanged in the completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattRequest {
    ReadOnlyProperties,
    Psm,
    StartCommand,
    StopCommand,
    StateChange,
    Volume,
    AudioStatusCcc,
    ServiceChangedCcc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: AttHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub value_handle: AttHandle,
    pub descriptors: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub handle: AttHandle,
    pub characteristics: Vec<Characteristic>,
}

/// GATT client transport.
pub trait GattClient {
    /// Registers the profile as a GATT client application.
    fn register_app(&self) -> Option<GattIf>;
    fn deregister_app(&self, gatt_if: GattIf);

    fn open(&self, gatt_if: GattIf, address: RawAddress, connection_type: ConnectionType);
    /// Cancels a pending open of the given kind. Cancelling
    /// [`ConnectionType::Background`] drops the acceptlist entry.
    fn cancel_open(&self, gatt_if: GattIf, address: RawAddress, connection_type: ConnectionType);
    fn close(&self, conn_id: ConnId);

    fn search_service(&self, conn_id: ConnId, uuid: Uuid);
    /// The discovered attribute database of the connection.
    fn services(&self, conn_id: ConnId) -> Vec<Service>;

    fn read_characteristic(&self, conn_id: ConnId, handle: AttHandle, request: GattRequest);
    fn write_characteristic(
        &self,
        conn_id: ConnId,
        handle: AttHandle,
        value: Vec<u8>,
        write_type: WriteType,
        request: GattRequest,
    );
    fn write_descriptor(
        &self,
        conn_id: ConnId,
        handle: AttHandle,
        value: Vec<u8>,
        request: GattRequest,
    );
    fn register_for_notifications(
        &self,
        gatt_if: GattIf,
        address: RawAddress,
        handle: AttHandle,
    ) -> GattStatus;

    /// Drops every queued, not yet issued operation on the connection.
    fn clean_queue(&self, conn_id: ConnId);
}

/// Security requirement of a credit-based channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSecurity {
    None,
    Encrypted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CocParameters {
    pub psm: u16,
    pub mtu: u16,
    pub mps: u16,
    pub security: ChannelSecurity,
}

/// Error code of a failed channel write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capError(pub u16);

impl fmt::Display for L2capError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l2cap error 0x{:x}", self.0)
    }
}

impl std::error::Error for L2capError {}

/// LE credit-based connection-oriented channels.
pub trait L2capCoc {
    /// Starts opening a channel; `None` if the request was refused outright.
    fn conn_open(&self, address: RawAddress, side: Side, params: CocParameters)
        -> Option<GapHandle>;
    fn conn_close(&self, gap_handle: GapHandle);
    fn write_data(&self, gap_handle: GapHandle, sdu: Vec<u8>) -> Result<(), L2capError>;
    /// Drains whatever the peer sent on the channel.
    fn read_data(&self, gap_handle: GapHandle) -> Vec<u8>;
    fn remote_mtu(&self, gap_handle: GapHandle) -> u16;
    /// Packets queued on the channel and not yet sent.
    fn queued_packets(&self, gap_handle: GapHandle) -> usize;
    /// Discards the queued packets, returning how many could not be flushed.
    fn flush_all(&self, gap_handle: GapHandle) -> usize;
    /// Credits the peer currently grants us, `None` when unknown.
    fn peer_credit(&self, gap_handle: GapHandle) -> Option<u16>;
}

pub trait SecurityManager {
    fn is_security_pending(&self, address: RawAddress) -> bool;
    fn is_encrypted(&self, address: RawAddress) -> bool;
    fn is_link_key_known(&self, address: RawAddress) -> bool;
    /// Requests LE encryption; completion arrives as an encryption event.
    fn set_encryption(&self, address: RawAddress);
}

/// LE PHYs, as reported by PHY update events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Arguments of an LE connection parameter update, in controller units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
    pub min_ce_len: u16,
    pub max_ce_len: u16,
}

/// Link-level requests to the controller.
pub trait LinkController {
    fn update_ble_conn_params(&self, address: RawAddress, params: ConnectionParameters) -> bool;
    fn set_ble_data_length(&self, address: RawAddress, tx_octets: u16);
    fn set_preferred_phy(&self, address: RawAddress, tx: Phy, rx: Phy);
    /// Starts an asynchronous RSSI read; false if it could not be issued.
    fn read_rssi(&self, address: RawAddress) -> bool;
}

pub trait ControllerInterface {
    fn supports_ble_2m_phy(&self) -> bool;
    /// Starts delivering ISO traffic activity events.
    fn start_iso_traffic_monitoring(&self);
}

/// The platform audio path feeding us PCM.
pub trait AudioSource {
    /// Starts the audio source; frames and suspend/resume requests then
    /// arrive as audio events.
    fn start(&self, codec: CodecConfiguration, delay_report_ms: u16);
    fn stop(&self);
}

/// Adaptive sample rate conversion, fed with interleaved 16-bit PCM.
pub trait Resampler {
    /// Returns zero or more resampled chunks for one input frame.
    fn run(&mut self, pcm: &[u8]) -> Vec<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResamplerParameters {
    pub channels: u8,
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub interval_us: u32,
}

pub type ResamplerFactory = Box<dyn Fn(ResamplerParameters) -> Box<dyn Resampler>>;

/// Pairing storage for hearing aids.
pub trait HearingAidStorage {
    fn load(&self, address: RawAddress) -> anyhow::Result<Option<StoredProperties>>;
    fn save(&self, device: &HearingDevice) -> anyhow::Result<()>;
}

/// A paired device as loaded from storage at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDevice {
    pub address: RawAddress,
    pub properties: StoredProperties,
    pub handles: GattHandles,
    pub is_acceptlisted: bool,
}

/// Connection state reported to the profile's user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileConnectionState {
    Disconnected,
    Connected,
}

pub trait HearingAidCallbacks {
    fn on_connection_state(&self, state: ProfileConnectionState, address: RawAddress);
    fn on_device_available(&self, capabilities: Capabilities, hi_sync_id: u64, address: RawAddress);
}

/// Everything the session talks to.
#[derive(Clone)]
pub struct AshaInterfaces {
    pub gatt: Rc<dyn GattClient>,
    pub l2cap: Rc<dyn L2capCoc>,
    pub security: Rc<dyn SecurityManager>,
    pub link: Rc<dyn LinkController>,
    pub controller: Rc<dyn ControllerInterface>,
    pub audio_source: Rc<dyn AudioSource>,
    pub storage: Rc<dyn HearingAidStorage>,
    pub callbacks: Rc<dyn HearingAidCallbacks>,
}
