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

//! Recording fakes of every collaborator of the session.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::codec::{CodecConfiguration, EncoderFactory, G722Encoder};
use super::config::AshaConfig;
use super::device::{Capabilities, ConnectionState, HearingDevice, Side, StoredProperties};
use super::ids::{AttHandle, ConnId, GapHandle, GattIf};
use super::interfaces::{
    AshaInterfaces, AudioSource, CocParameters, ConnectionParameters, ConnectionType,
    ControllerInterface, GattClient, GattRequest, GattStatus, HearingAidCallbacks,
    HearingAidStorage, L2capCoc, L2capError, LinkController, Phy, ProfileConnectionState,
    SecurityManager, Service, WriteType,
};
use super::session::SessionController;
use crate::core::address::RawAddress;
use crate::core::uuid::Uuid;

pub const GATT_IF: GattIf = GattIf(3);

/// Handles used by devices built with [`Harness::controller_with_devices`].
pub const CONTROL_POINT: AttHandle = AttHandle(0x20);
pub const AUDIO_STATUS: AttHandle = AttHandle(0x22);
pub const AUDIO_STATUS_CCC: AttHandle = AttHandle(0x23);
pub const VOLUME: AttHandle = AttHandle(0x25);
pub const PSM: AttHandle = AttHandle(0x27);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCall {
    RegisterApp,
    DeregisterApp(GattIf),
    Open { address: RawAddress, connection_type: ConnectionType },
    CancelOpen { address: RawAddress, connection_type: ConnectionType },
    Close(ConnId),
    SearchService { conn_id: ConnId, uuid: Uuid },
    Read { conn_id: ConnId, handle: AttHandle, request: GattRequest },
    Write {
        conn_id: ConnId,
        handle: AttHandle,
        value: Vec<u8>,
        write_type: WriteType,
        request: GattRequest,
    },
    WriteDescriptor { conn_id: ConnId, handle: AttHandle, value: Vec<u8>, request: GattRequest },
    RegisterForNotifications { address: RawAddress, handle: AttHandle },
    CleanQueue(ConnId),
}

pub struct FakeGatt {
    calls: RefCell<Vec<GattCall>>,
    pub services: RefCell<HashMap<ConnId, Vec<Service>>>,
    pub notification_status: Cell<GattStatus>,
}

impl FakeGatt {
    fn new() -> Self {
        Self {
            calls: RefCell::new(vec![]),
            services: RefCell::new(HashMap::new()),
            notification_status: Cell::new(GattStatus::Success),
        }
    }

    fn record(&self, call: GattCall) {
        self.calls.borrow_mut().push(call);
    }

    pub fn take_calls(&self) -> Vec<GattCall> {
        self.calls.take()
    }

    pub fn calls(&self) -> Vec<GattCall> {
        self.calls.borrow().clone()
    }

    /// Control point writes, as `(conn_id, value)`.
    pub fn control_point_writes(&self) -> Vec<(ConnId, Vec<u8>)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                GattCall::Write { conn_id, handle, value, .. } if *handle == CONTROL_POINT => {
                    Some((*conn_id, value.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn opens(&self, address: RawAddress) -> Vec<ConnectionType> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                GattCall::Open { address: a, connection_type } if *a == address => {
                    Some(*connection_type)
                }
                _ => None,
            })
            .collect()
    }
}

impl GattClient for FakeGatt {
    fn register_app(&self) -> Option<GattIf> {
        self.record(GattCall::RegisterApp);
        Some(GATT_IF)
    }

    fn deregister_app(&self, gatt_if: GattIf) {
        self.record(GattCall::DeregisterApp(gatt_if));
    }

    fn open(&self, _gatt_if: GattIf, address: RawAddress, connection_type: ConnectionType) {
        self.record(GattCall::Open { address, connection_type });
    }

    fn cancel_open(&self, _gatt_if: GattIf, address: RawAddress, connection_type: ConnectionType) {
        self.record(GattCall::CancelOpen { address, connection_type });
    }

    fn close(&self, conn_id: ConnId) {
        self.record(GattCall::Close(conn_id));
    }

    fn search_service(&self, conn_id: ConnId, uuid: Uuid) {
        self.record(GattCall::SearchService { conn_id, uuid });
    }

    fn services(&self, conn_id: ConnId) -> Vec<Service> {
        self.services.borrow().get(&conn_id).cloned().unwrap_or_default()
    }

    fn read_characteristic(&self, conn_id: ConnId, handle: AttHandle, request: GattRequest) {
        self.record(GattCall::Read { conn_id, handle, request });
    }

    fn write_characteristic(
        &self,
        conn_id: ConnId,
        handle: AttHandle,
        value: Vec<u8>,
        write_type: WriteType,
        request: GattRequest,
    ) {
        self.record(GattCall::Write { conn_id, handle, value, write_type, request });
    }

    fn write_descriptor(
        &self,
        conn_id: ConnId,
        handle: AttHandle,
        value: Vec<u8>,
        request: GattRequest,
    ) {
        self.record(GattCall::WriteDescriptor { conn_id, handle, value, request });
    }

    fn register_for_notifications(
        &self,
        _gatt_if: GattIf,
        address: RawAddress,
        handle: AttHandle,
    ) -> GattStatus {
        self.record(GattCall::RegisterForNotifications { address, handle });
        self.notification_status.get()
    }

    fn clean_queue(&self, conn_id: ConnId) {
        self.record(GattCall::CleanQueue(conn_id));
    }
}

#[derive(Default)]
pub struct L2capSinkState {
    pub opened: Vec<(RawAddress, Side, CocParameters, GapHandle)>,
    pub closed: Vec<GapHandle>,
    pub written: Vec<(GapHandle, Vec<u8>)>,
    pub queued: HashMap<GapHandle, usize>,
    /// Channels without an entry fail the credit read.
    pub credits: HashMap<GapHandle, u16>,
    pub flushed: Vec<GapHandle>,
    pub rx: Vec<u8>,
}

pub struct FakeL2cap {
    next_handle: Cell<u16>,
    pub state: RefCell<L2capSinkState>,
}

impl FakeL2cap {
    pub fn written_to(&self, gap_handle: GapHandle) -> Vec<Vec<u8>> {
        self.state
            .borrow()
            .written
            .iter()
            .filter(|(handle, _)| *handle == gap_handle)
            .map(|(_, sdu)| sdu.clone())
            .collect()
    }

    pub fn last_opened(&self) -> Option<GapHandle> {
        self.state.borrow().opened.last().map(|(_, _, _, handle)| *handle)
    }
}

impl L2capCoc for FakeL2cap {
    fn conn_open(
        &self,
        address: RawAddress,
        side: Side,
        params: CocParameters,
    ) -> Option<GapHandle> {
        let handle = GapHandle(self.next_handle.get());
        self.next_handle.set(handle.0 + 1);
        self.state.borrow_mut().opened.push((address, side, params, handle));
        Some(handle)
    }

    fn conn_close(&self, gap_handle: GapHandle) {
        self.state.borrow_mut().closed.push(gap_handle);
    }

    fn write_data(&self, gap_handle: GapHandle, sdu: Vec<u8>) -> Result<(), L2capError> {
        self.state.borrow_mut().written.push((gap_handle, sdu));
        Ok(())
    }

    fn read_data(&self, _gap_handle: GapHandle) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().rx)
    }

    fn remote_mtu(&self, _gap_handle: GapHandle) -> u16 {
        512
    }

    fn queued_packets(&self, gap_handle: GapHandle) -> usize {
        self.state.borrow().queued.get(&gap_handle).copied().unwrap_or(0)
    }

    fn flush_all(&self, gap_handle: GapHandle) -> usize {
        let mut state = self.state.borrow_mut();
        state.queued.remove(&gap_handle);
        state.flushed.push(gap_handle);
        0
    }

    fn peer_credit(&self, gap_handle: GapHandle) -> Option<u16> {
        self.state.borrow().credits.get(&gap_handle).copied()
    }
}

pub struct FakeSecurity {
    pub encrypted: Cell<bool>,
    pub pending: Cell<bool>,
    pub link_key_known: Cell<bool>,
    pub encryption_requests: RefCell<Vec<RawAddress>>,
}

impl SecurityManager for FakeSecurity {
    fn is_security_pending(&self, _address: RawAddress) -> bool {
        self.pending.get()
    }

    fn is_encrypted(&self, _address: RawAddress) -> bool {
        self.encrypted.get()
    }

    fn is_link_key_known(&self, _address: RawAddress) -> bool {
        self.link_key_known.get()
    }

    fn set_encryption(&self, address: RawAddress) {
        self.encryption_requests.borrow_mut().push(address);
    }
}

#[derive(Default)]
pub struct FakeLink {
    pub conn_params: RefCell<Vec<(RawAddress, ConnectionParameters)>>,
    pub data_length: RefCell<Vec<(RawAddress, u16)>>,
    pub phy_requests: RefCell<Vec<RawAddress>>,
    pub rssi_reads: RefCell<Vec<RawAddress>>,
}

impl LinkController for FakeLink {
    fn update_ble_conn_params(&self, address: RawAddress, params: ConnectionParameters) -> bool {
        self.conn_params.borrow_mut().push((address, params));
        true
    }

    fn set_ble_data_length(&self, address: RawAddress, tx_octets: u16) {
        self.data_length.borrow_mut().push((address, tx_octets));
    }

    fn set_preferred_phy(&self, address: RawAddress, tx: Phy, rx: Phy) {
        assert_eq!((tx, rx), (Phy::Le2M, Phy::Le2M));
        self.phy_requests.borrow_mut().push(address);
    }

    fn read_rssi(&self, address: RawAddress) -> bool {
        self.rssi_reads.borrow_mut().push(address);
        true
    }
}

#[derive(Default)]
pub struct FakeController {
    pub supports_2m: Cell<bool>,
    pub iso_monitoring: Cell<usize>,
}

impl ControllerInterface for FakeController {
    fn supports_ble_2m_phy(&self) -> bool {
        self.supports_2m.get()
    }

    fn start_iso_traffic_monitoring(&self) {
        self.iso_monitoring.set(self.iso_monitoring.get() + 1);
    }
}

#[derive(Default)]
pub struct FakeAudioSource {
    pub starts: RefCell<Vec<(CodecConfiguration, u16)>>,
    pub stops: Cell<usize>,
}

impl AudioSource for FakeAudioSource {
    fn start(&self, codec: CodecConfiguration, delay_report_ms: u16) {
        self.starts.borrow_mut().push((codec, delay_report_ms));
    }

    fn stop(&self) {
        self.stops.set(self.stops.get() + 1);
    }
}

#[derive(Default)]
pub struct FakeStorage {
    pub stored: RefCell<HashMap<RawAddress, StoredProperties>>,
    pub saved: RefCell<Vec<RawAddress>>,
}

impl HearingAidStorage for FakeStorage {
    fn load(&self, address: RawAddress) -> anyhow::Result<Option<StoredProperties>> {
        Ok(self.stored.borrow().get(&address).copied())
    }

    fn save(&self, device: &HearingDevice) -> anyhow::Result<()> {
        self.saved.borrow_mut().push(device.address);
        self.stored.borrow_mut().insert(device.address, device.stored_properties());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCallbacks {
    pub states: RefCell<Vec<(ProfileConnectionState, RawAddress)>>,
    pub available: RefCell<Vec<(Capabilities, u64, RawAddress)>>,
}

impl HearingAidCallbacks for FakeCallbacks {
    fn on_connection_state(&self, state: ProfileConnectionState, address: RawAddress) {
        self.states.borrow_mut().push((state, address));
    }

    fn on_device_available(&self, capabilities: Capabilities, hi_sync_id: u64, address: RawAddress) {
        self.available.borrow_mut().push((capabilities, hi_sync_id, address));
    }
}

/// Emits one byte per sample pair, the low byte of the first sample.
struct SamplingEncoder {
    encode_calls: Rc<Cell<usize>>,
}

impl G722Encoder for SamplingEncoder {
    fn encode(&mut self, pcm: &[i16], out: &mut Vec<u8>) -> usize {
        self.encode_calls.set(self.encode_calls.get() + 1);
        out.extend(pcm.chunks(2).map(|pair| pair[0] as u8));
        pcm.len() / 2
    }
}

pub struct Harness {
    pub gatt: Rc<FakeGatt>,
    pub l2cap: Rc<FakeL2cap>,
    pub security: Rc<FakeSecurity>,
    pub link: Rc<FakeLink>,
    pub controller: Rc<FakeController>,
    pub audio_source: Rc<FakeAudioSource>,
    pub storage: Rc<FakeStorage>,
    pub callbacks: Rc<FakeCallbacks>,
    pub encoders_created: Rc<Cell<usize>>,
    pub encode_calls: Rc<Cell<usize>>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            gatt: Rc::new(FakeGatt::new()),
            l2cap: Rc::new(FakeL2cap {
                next_handle: Cell::new(0x40),
                state: RefCell::new(L2capSinkState::default()),
            }),
            security: Rc::new(FakeSecurity {
                encrypted: Cell::new(true),
                pending: Cell::new(false),
                link_key_known: Cell::new(false),
                encryption_requests: RefCell::new(vec![]),
            }),
            link: Rc::default(),
            controller: Rc::default(),
            audio_source: Rc::default(),
            storage: Rc::default(),
            callbacks: Rc::default(),
            encoders_created: Rc::default(),
            encode_calls: Rc::default(),
        }
    }

    pub fn interfaces(&self) -> AshaInterfaces {
        AshaInterfaces {
            gatt: self.gatt.clone(),
            l2cap: self.l2cap.clone(),
            security: self.security.clone(),
            link: self.link.clone(),
            controller: self.controller.clone(),
            audio_source: self.audio_source.clone(),
            storage: self.storage.clone(),
            callbacks: self.callbacks.clone(),
        }
    }

    pub fn encoder_factory(&self) -> EncoderFactory {
        let created = self.encoders_created.clone();
        let encode_calls = self.encode_calls.clone();
        Box::new(move |_bit_rate: u32| -> Box<dyn G722Encoder> {
            created.set(created.get() + 1);
            Box::new(SamplingEncoder { encode_calls: encode_calls.clone() })
        })
    }

    /// An initialized session.
    pub fn controller(&self, config: AshaConfig) -> SessionController {
        let mut session =
            SessionController::new(config, self.interfaces(), self.encoder_factory(), None);
        assert!(session.initialize());
        session
    }

    /// A session whose devices are GATT connected with every handle
    /// resolved but no channel open. The first device is the left one.
    pub fn controller_with_devices(&self, devices: &[(RawAddress, u64)]) -> SessionController {
        let mut session = self.controller(AshaConfig::default());
        for (index, (address, hi_sync_id)) in devices.iter().enumerate() {
            let mut device = HearingDevice::new(*address, false);
            device.hi_sync_id = *hi_sync_id;
            device.codecs = 0b10;
            if index > 0 {
                device.capabilities = Capabilities::SIDE;
            }
            if *hi_sync_id != 0 {
                device.capabilities |= Capabilities::BINAURAL;
            }
            device.conn_id = ConnId(index as u16 + 1);
            device.handles.audio_control_point = CONTROL_POINT;
            device.handles.audio_status = AUDIO_STATUS;
            device.handles.audio_status_ccc = AUDIO_STATUS_CCC;
            device.handles.volume = VOLUME;
            device.handles.read_psm = PSM;
            device.state = ConnectionState::Ready;
            session.devices.add(device);
        }
        session
    }
}
