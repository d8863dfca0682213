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

//! Per-device connection flow: GATT open, encryption, discovery, PSM read,
//! channel open, connection parameters, and the way back down.

use log::{debug, error, info, trace, warn};

use super::codec::CodecId;
use super::config::INTERVAL_10_MS;
use super::device::{
    Capabilities, ConnectionState, ConnectionUpdateStatus, RssiLog, PHY_UPDATE_RETRY_LIMIT, READ_RSSI_NUM_TRIES,
};
use super::events::GapEvent;
use super::ids::{AttHandle, ConnId, GapHandle};
use super::interfaces::{
    ChannelSecurity, Characteristic, CocParameters, ConnectionParameters, ConnectionType,
    GattRequest, GattStatus, Phy, ProfileConnectionState, Service,
};
use super::session::SessionController;
use super::wire::{self, ReadOnlyProperties, StateChange};
use super::{
    AUDIO_CONTROL_POINT_UUID, AUDIO_STATUS_UUID, BLE_DATA_LENGTH, CE_LEN_20MS_CI_ISO_RUNNING,
    CLIENT_CHARACTERISTIC_CONFIG_UUID, CONNECTION_INTERVAL_10MS_PARAM,
    CONNECTION_INTERVAL_20MS_PARAM, CONNECTION_LATENCY, GATT_SERVICE_UUID, HEARING_AID_UUID,
    L2CAP_MPS, L2CAP_MTU, LE_PSM_UUID, MAX_CE_LEN_20MS_CI, MIN_CE_LEN_10MS_CI,
    MIN_CE_LEN_20MS_CI, READ_ONLY_PROPERTIES_UUID, SERVICE_CHANGED_UUID, SUPERVISION_TIMEOUT,
    VOLUME_UUID,
};
use crate::core::address::RawAddress;

impl SessionController {
    pub(super) fn on_gatt_connected(
        &mut self,
        status: GattStatus,
        conn_id: ConnId,
        address: RawAddress,
    ) {
        let gatt_if = self.gatt_if;
        let Some(device) = self.devices.find_by_address_mut(&address) else {
            // Happens when the profile is quickly disabled and enabled again.
            warn!("Closing connection to non hearing-aid device: bd_addr={address}");
            self.interfaces.gatt.close(conn_id);
            return;
        };

        info!("address={address}, conn_id={conn_id}");

        if !status.is_success() {
            if !device.connecting_actively {
                // Acceptlist connection failed, the next advertisement retries.
                debug!("background connection failed: bd_addr={address} status={status}");
                return;
            }

            if device.switch_to_background_after_failure {
                device.connecting_actively = false;
                device.switch_to_background_after_failure = false;
                self.interfaces.gatt.open(gatt_if, address, ConnectionType::Background);
            } else {
                info!("Failed to connect to Hearing Aid device, bda={address}");
                self.devices.remove(&address);
                self.report_connection_state(ProfileConnectionState::Disconnected, address);
            }
            return;
        }

        device.conn_id = conn_id;
        device.state = ConnectionState::Encrypting;
        let hi_sync_id = device.hi_sync_id;

        self.promote_siblings(&address, hi_sync_id);

        let interval = self.update_ble_conn_params(&address);
        if let Some(device) = self.devices.find_by_address_mut(&address) {
            device.connection_update_status = ConnectionUpdateStatus::Started;
            device.requested_connection_interval = interval;
        }

        if self.interfaces.controller.supports_ble_2m_phy() {
            info!("{address} set preferred 2M PHY");
            self.interfaces.link.set_preferred_phy(address, Phy::Le2M, Phy::Le2M);
        }

        self.interfaces.link.set_ble_data_length(address, BLE_DATA_LENGTH);

        let security = self.interfaces.security.clone();
        if security.is_security_pending(address) {
            // A security procedure collided with ours; its completion
            // arrives as an encryption event.
            return;
        }

        if security.is_encrypted(address) {
            self.on_encryption_complete(&address, true);
            return;
        }

        if security.is_link_key_known(address) {
            // Bonded but not encrypted yet.
            security.set_encryption(address);
            return;
        }

        self.on_encryption_complete(&address, true);
    }

    /// Requests the connection parameters matching the configured audio
    /// interval and returns the interval asked for.
    pub(super) fn update_ble_conn_params(&mut self, address: &RawAddress) -> u16 {
        let mut max_ce_len = MAX_CE_LEN_20MS_CI;
        let (mut min_ce_len, connection_interval) = if self.config.data_interval_ms
            == INTERVAL_10_MS
        {
            (MIN_CE_LEN_10MS_CI, CONNECTION_INTERVAL_10MS_PARAM)
        } else if self.is_iso_running {
            // The controller may fail to grant a long connection event while
            // ISO is active. Connect with a minimal one and redo the update
            // once ISO traffic stops.
            max_ce_len = CE_LEN_20MS_CI_ISO_RUNNING;
            self.needs_parameter_update = true;
            (CE_LEN_20MS_CI_ISO_RUNNING, CONNECTION_INTERVAL_20MS_PARAM)
        } else {
            self.needs_parameter_update = false;
            (MIN_CE_LEN_20MS_CI, CONNECTION_INTERVAL_20MS_PARAM)
        };

        let ce_len_override = self.config.ce_len_override_for(address);
        if let Some(min) = ce_len_override.min {
            warn!("min_ce_len={min_ce_len} for device {address} is overwritten to {min}");
            min_ce_len = min;
        }
        if let Some(max) = ce_len_override.max {
            warn!("max_ce_len={max_ce_len} for device {address} is overwritten to {max}");
            max_ce_len = max;
        }

        info!("update ble conn params for device {address} min_ce_len:{min_ce_len} max_ce_len:{max_ce_len}");
        let params = ConnectionParameters {
            min_interval: connection_interval,
            max_interval: connection_interval,
            latency: CONNECTION_LATENCY,
            supervision_timeout: SUPERVISION_TIMEOUT,
            min_ce_len,
            max_ce_len,
        };
        if !self.interfaces.link.update_ble_conn_params(*address, params) {
            warn!("Unable to update L2CAP ble connection parameters peer:{address}");
        }
        connection_interval
    }

    pub(super) fn on_iso_traffic_event(&mut self, is_active: bool) {
        self.is_iso_running = is_active;
        if is_active {
            self.needs_parameter_update = true;
        }

        info!(
            "is_iso_running={} needs_parameter_update={}",
            self.is_iso_running, self.needs_parameter_update
        );

        if !self.needs_parameter_update {
            return;
        }
        let connected: Vec<RawAddress> =
            self.devices.iter().filter(|d| d.conn_id.is_connected()).map(|d| d.address).collect();
        for address in connected {
            self.start_connection_update(&address);
        }
    }

    fn start_connection_update(&mut self, address: &RawAddress) {
        let interval = self.update_ble_conn_params(address);
        if let Some(device) = self.devices.find_by_address_mut(address) {
            device.connection_update_status = ConnectionUpdateStatus::Started;
            device.requested_connection_interval = interval;
        }
    }

    /// `update` is `None` when the update is abandoned because the device
    /// went away.
    pub(super) fn on_connection_update_complete(
        &mut self,
        conn_id: ConnId,
        update: Option<(GattStatus, u16)>,
    ) {
        let Some(device) = self.devices.find_by_conn_id_mut(conn_id) else {
            error!("unknown device: conn_id={conn_id}");
            return;
        };
        let address = device.address;

        match update {
            Some((GattStatus::Success, interval)) => {
                let same_conn_interval = device.requested_connection_interval == interval;
                match device.connection_update_status {
                    ConnectionUpdateStatus::Completed if !same_conn_interval => {
                        warn!(
                            "Unexpected change. Redo. connection interval={interval}, expected={}, conn_id={conn_id}",
                            device.requested_connection_interval
                        );
                        device.connection_update_status = ConnectionUpdateStatus::Awaiting;
                    }
                    ConnectionUpdateStatus::Started if same_conn_interval => {
                        info!("Connection update completed: conn_id={conn_id} bd_addr={address}");
                        device.connection_update_status = ConnectionUpdateStatus::Completed;
                    }
                    ConnectionUpdateStatus::Started => {
                        // Wait for the completion of the update we asked for.
                        warn!(
                            "Ignored. Different connection interval={interval}, expected={}, conn_id={conn_id}",
                            device.requested_connection_interval
                        );
                        return;
                    }
                    _ => {}
                }

                // Both ears learn the new interval.
                let change = StateChange::ConnectionUpdate { interval: interval as u8 };
                self.send_state_change_to_other_side(&address, change);
                self.send_state_change(&address, change);
            }
            Some((status, _)) => {
                info!(
                    "error status={status}, conn_id={conn_id} bd_addr={address}, connection_update_status={:?}",
                    device.connection_update_status
                );
                if device.connection_update_status == ConnectionUpdateStatus::Started {
                    error!("Redo Connection Interval change");
                    device.connection_update_status = ConnectionUpdateStatus::Awaiting;
                }
            }
            None => device.connection_update_status = ConnectionUpdateStatus::None,
        }

        self.check_device_ready(&address);

        // Only one update in flight at a time: kick off the next one waiting.
        let awaiting = self
            .devices
            .iter()
            .find(|d| {
                d.conn_id.is_connected()
                    && d.connection_update_status == ConnectionUpdateStatus::Awaiting
            })
            .map(|d| d.address);
        if let Some(next) = awaiting {
            self.start_connection_update(&next);
        }
    }

    /// Ready once both the channel is open and the connection parameters
    /// are in place, whichever comes last.
    fn check_device_ready(&mut self, address: &RawAddress) {
        let ready = self.devices.find_by_address(address).is_some_and(|d| {
            !d.accepting_audio
                && d.connection_update_status == ConnectionUpdateStatus::Completed
                && d.gap_opened
        });
        if ready {
            self.on_device_ready(address);
        }
    }

    pub(super) fn on_encryption_complete(&mut self, address: &RawAddress, success: bool) {
        let Some(device) = self.devices.find_by_address_mut(address) else {
            error!("unknown device: bd_addr={address}");
            return;
        };

        if !success {
            error!("encryption failed: bd_addr={address}");
            let (conn_id, first_connection) = (device.conn_id, device.first_connection);
            if conn_id.is_connected() {
                self.interfaces.gatt.close(conn_id);
            }
            if first_connection {
                self.report_connection_state(ProfileConnectionState::Disconnected, *address);
            }
            return;
        }

        info!("encryption successful: bd_addr={address}");

        if device.handles.all_resolved() {
            // Cached from a previous connection.
            self.read_psm(address);
        } else {
            info!("starting service search request for ASHA: bd_addr={address}");
            device.first_connection = true;
            device.state = ConnectionState::ServiceDiscovery;
            self.interfaces.gatt.search_service(device.conn_id, HEARING_AID_UUID);
        }
    }

    pub(super) fn on_phy_update(
        &mut self,
        conn_id: ConnId,
        tx_phy: Phy,
        rx_phy: Phy,
        status: GattStatus,
    ) {
        let Some(device) = self.devices.find_by_conn_id_mut(conn_id) else {
            error!("unknown device: conn_id={conn_id}");
            return;
        };
        let address = device.address;

        if !status.is_success() {
            warn!("phy update failed: bd_addr={address} status={status}");
            return;
        }

        if tx_phy == Phy::Le2M && rx_phy == Phy::Le2M {
            info!("phy update to 2M successful: bd_addr={address}");
            device.phy_update_retry_remain = PHY_UPDATE_RETRY_LIMIT;
            return;
        }

        if device.phy_update_retry_remain > 0 {
            info!(
                "phy update successful with unexpected phys, retrying: bd_addr={address} tx_phy={tx_phy:?} rx_phy={rx_phy:?}"
            );
            device.phy_update_retry_remain -= 1;
            self.interfaces.link.set_preferred_phy(address, Phy::Le2M, Phy::Le2M);
        } else {
            warn!(
                "phy update successful with unexpected phys, exceeded retry count: bd_addr={address} tx_phy={tx_phy:?} rx_phy={rx_phy:?}"
            );
        }
    }

    pub(super) fn on_service_changed(&mut self, address: &RawAddress) {
        let Some(device) = self.devices.find_by_address_mut(address) else {
            error!("unknown device: bd_addr={address}");
            return;
        };

        info!("bd_addr={address}");

        device.first_connection = true;
        device.service_changed_rcvd = true;
        device.state = ConnectionState::ServiceDiscovery;
        self.interfaces.gatt.clean_queue(device.conn_id);

        // The channel is reopened once discovery and the PSM read are done.
        if device.gap_handle.is_valid() {
            self.interfaces.l2cap.conn_close(device.gap_handle);
            device.gap_handle = GapHandle::INVALID;
        }
        device.gap_opened = false;
        device.accepting_audio = false;
        device.playback_started = false;
        device.command_acked = false;
    }

    pub(super) fn on_service_discovery_done(&mut self, address: &RawAddress) {
        let Some(device) = self.devices.find_by_address_mut(address) else {
            error!("unknown device: bd_addr={address}");
            return;
        };

        info!("bd_addr={address}");

        if device.service_changed_rcvd || !device.handles.all_resolved() {
            info!("starting service search request for ASHA: bd_addr={address}");
            device.state = ConnectionState::ServiceDiscovery;
            self.interfaces.gatt.search_service(device.conn_id, HEARING_AID_UUID);
        }
    }

    pub(super) fn on_service_search_complete(&mut self, conn_id: ConnId, status: GattStatus) {
        let Some(device) = self.devices.find_by_conn_id(conn_id) else {
            error!("unknown device: conn_id={conn_id}");
            return;
        };
        let address = device.address;

        if !device.first_connection {
            info!("service discovery result ignored: bd_addr={address}");
            return;
        }

        if !status.is_success() {
            error!("service discovery failed: bd_addr={address} status={status}");
            self.report_connection_state(ProfileConnectionState::Disconnected, address);
            return;
        }

        info!("service discovery successful: bd_addr={address}");

        let services = self.interfaces.gatt.services(conn_id);
        let mut asha_service: Option<&Service> = None;
        let mut service_changed_ccc = None;
        for service in &services {
            if service.uuid == GATT_SERVICE_UUID {
                info!("Found GATT server service, handle={}", service.handle);
                service_changed_ccc = find_service_changed_ccc(&address, service);
            } else if service.uuid == HEARING_AID_UUID {
                info!("Found Hearing Aid service, handle={}", service.handle);
                asha_service = Some(service);
            }
        }

        let Some(service) = asha_service else {
            error!("No Hearing Aid service found");
            self.report_connection_state(ProfileConnectionState::Disconnected, address);
            return;
        };

        let cached = match self.interfaces.storage.load(address) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("cannot load stored properties of {address}: {e:#}");
                None
            }
        };

        let Some(device) = self.devices.find_by_conn_id_mut(conn_id) else {
            return;
        };
        device.state = ConnectionState::CharacteristicResolution;
        if let Some(handle) = service_changed_ccc {
            device.handles.service_changed_ccc = handle;
        }
        if let Some(properties) = cached {
            device.apply_properties(properties);
        }

        for characteristic in &service.characteristics {
            let uuid = characteristic.uuid;
            let handle = characteristic.value_handle;
            if uuid == READ_ONLY_PROPERTIES_UUID {
                if cached.is_none() {
                    debug!("Reading read only properties {handle}");
                    self.interfaces.gatt.read_characteristic(
                        conn_id,
                        handle,
                        GattRequest::ReadOnlyProperties,
                    );
                }
            } else if uuid == AUDIO_CONTROL_POINT_UUID {
                device.handles.audio_control_point = handle;
            } else if uuid == AUDIO_STATUS_UUID {
                device.handles.audio_status = handle;
                let Some(ccc) = find_ccc_handle(characteristic) else {
                    error!("cannot find Audio Status CCC descriptor");
                    continue;
                };
                device.handles.audio_status_ccc = ccc;
                info!("audio_status_handle={handle}, ccc={ccc}");
            } else if uuid == VOLUME_UUID {
                device.handles.volume = handle;
            } else if uuid == LE_PSM_UUID {
                device.handles.read_psm = handle;
            } else {
                warn!("Unknown characteristic found:{uuid}");
            }
        }

        device.service_changed_rcvd = false;

        self.read_psm(&address);
    }

    fn read_psm(&mut self, address: &RawAddress) {
        let Some(device) = self.devices.find_by_address_mut(address) else {
            return;
        };
        if device.handles.read_psm.is_resolved() {
            info!("bd_addr={address} handle={}", device.handles.read_psm);
            device.state = ConnectionState::SocketOpening;
            self.interfaces.gatt.read_characteristic(
                device.conn_id,
                device.handles.read_psm,
                GattRequest::Psm,
            );
        }
    }

    pub(super) fn on_notification(&mut self, conn_id: ConnId, handle: AttHandle, value: &[u8]) {
        let Some(device) = self.devices.find_by_conn_id_mut(conn_id) else {
            error!("unknown device: conn_id={conn_id}");
            return;
        };
        let address = device.address;

        if device.handles.audio_status != handle {
            warn!(
                "unexpected handle: bd_addr={address} audio_status_handle={} handle={handle}",
                device.handles.audio_status
            );
            return;
        }

        let Some(&status) = value.first() else {
            warn!("invalid data length (expected 1+ bytes): bd_addr={address} len=0");
            return;
        };

        if status != 0 {
            warn!("received error status: bd_addr={address} status=0x{status:x}");
            return;
        }

        if !device.command_acked {
            warn!("audio status before START was acknowledged, ignored: bd_addr={address}");
            return;
        }

        info!("received success notification: bd_addr={address}, playback started");
        device.playback_started = true;
    }

    pub(super) fn on_start_command_written(&mut self, conn_id: ConnId) {
        let Some(device) = self.devices.find_by_conn_id_mut(conn_id) else {
            error!("Skipping unknown device, conn_id={conn_id}");
            return;
        };
        info!("START acknowledged: {}", device.address);
        device.command_acked = true;
    }

    pub(super) fn on_read_only_properties_read(
        &mut self,
        conn_id: ConnId,
        status: GattStatus,
        value: &[u8],
    ) {
        let Some(device) = self.devices.find_by_conn_id_mut(conn_id) else {
            error!("unknown device: conn_id={conn_id}");
            return;
        };
        let address = device.address;

        if !status.is_success() {
            error!("error reading read only properties: bd_addr={address} status={status}");
            return;
        }

        let properties = match ReadOnlyProperties::parse(value) {
            Ok(properties) => properties,
            Err(e) => {
                warn!("bad read only properties: bd_addr={address}: {e}");
                self.fail_device(&address);
                return;
            }
        };

        device.capabilities = properties.capabilities;
        device.hi_sync_id = properties.hi_sync_id;
        device.render_delay = properties.render_delay;
        device.preparation_delay = properties.preparation_delay;
        device.codecs = properties.codecs;

        if properties.capabilities.has_reserved_bits() {
            warn!(
                "reserved capabilities bits are set: bd_addr={address} capabilities=0x{:x}",
                properties.capabilities.bits()
            );
        }

        let g722_16khz_supported = CodecId::G722At16Khz.is_in(properties.codecs);
        let g722_24khz_supported = CodecId::G722At24Khz.is_in(properties.codecs);
        if !g722_16khz_supported {
            warn!("mandatory codec G722@16kHz not supported: bd_addr={address}");
        }

        info!(
            "device capabilities: bd_addr={address} side={} binaural={} CSIS_supported={} hi_sync_id=0x{:x} render_delay={} preparation_delay={} G722@16kHz_supported={} G722@24kHz_supported={}",
            properties.capabilities.side().name(),
            properties.capabilities.contains(Capabilities::BINAURAL),
            properties.capabilities.contains(Capabilities::CSIS),
            properties.hi_sync_id,
            properties.render_delay,
            properties.preparation_delay,
            g722_16khz_supported,
            g722_24khz_supported
        );
    }

    /// Gives up on a device whose peripheral sent something unusable.
    fn fail_device(&mut self, address: &RawAddress) {
        self.do_disconnect_clean_up(address);
        self.devices.remove(address);
        self.report_connection_state(ProfileConnectionState::Disconnected, *address);
    }

    pub(super) fn on_psm_read(&mut self, conn_id: ConnId, status: GattStatus, value: &[u8]) {
        let Some(device) = self.devices.find_by_conn_id(conn_id) else {
            error!("unknown device: conn_id={conn_id}");
            return;
        };
        let address = device.address;

        if !status.is_success() {
            error!("error reading PSM: bd_addr={address} status={status}");
            return;
        }

        let psm = match wire::parse_psm(value) {
            Ok(psm) => psm,
            Err(e) => {
                error!("invalid PSM: bd_addr={address}: {e}");
                return;
            }
        };

        info!("read PSM: bd_addr={address} psm=0x{psm:x}");

        if !device.gap_handle.is_valid() && self.interfaces.security.is_encrypted(address) {
            self.connect_socket(&address, psm);
        }
    }

    fn connect_socket(&mut self, address: &RawAddress, psm: u16) {
        info!("bd_addr={address} psm=0x{psm:x}");

        self.send_enable_service_changed_ind(address);

        let Some(device) = self.devices.find_by_address_mut(address) else {
            return;
        };
        // Encryption is requested again at channel level because L2CAP may
        // silently re-establish the link for a pending channel request.
        let security = if self.config.encrypted_l2c_coc {
            ChannelSecurity::Encrypted
        } else {
            ChannelSecurity::None
        };
        let params = CocParameters { psm, mtu: L2CAP_MTU, mps: L2CAP_MPS, security };
        match self.interfaces.l2cap.conn_open(*address, device.side(), params) {
            Some(gap_handle) => {
                device.gap_handle = gap_handle;
                info!("sent GAP connect request: bd_addr={address}, gap_handle={gap_handle}");
            }
            None => error!("failed to open socket: bd_addr={address}"),
        }
    }

    fn send_enable_service_changed_ind(&self, address: &RawAddress) {
        let Some(device) = self.devices.find_by_address(address) else {
            return;
        };
        if !device.handles.service_changed_ccc.is_resolved() {
            debug!("no service changed CCC known: bd_addr={address}");
            return;
        }
        info!("bd_addr={address}");
        self.interfaces.gatt.write_descriptor(
            device.conn_id,
            device.handles.service_changed_ccc,
            wire::ccc_value(wire::CCC_INDICATION),
            GattRequest::ServiceChangedCcc,
        );
    }

    /// The channel is open and the connection parameters are in place.
    pub(super) fn on_device_ready(&mut self, address: &RawAddress) {
        let Some(device) = self.devices.find_by_address_mut(address) else {
            error!("unknown device: bd_addr={address}");
            return;
        };

        info!("bd_addr={address}");

        if device.first_connection {
            if let Err(e) = self.interfaces.storage.save(device) {
                warn!("cannot store hearing aid {address}: {e:#}");
            }
            device.first_connection = false;
        }

        let register_status = self.interfaces.gatt.register_for_notifications(
            self.gatt_if,
            *address,
            device.handles.audio_status,
        );
        if !register_status.is_success() {
            error!(
                "failed to register for notifications: bd_addr={address} status={register_status} handle={}",
                device.handles.audio_status
            );
            return;
        }

        self.interfaces.gatt.write_descriptor(
            device.conn_id,
            device.handles.audio_status_ccc,
            wire::ccc_value(wire::CCC_NOTIFICATION),
            GattRequest::AudioStatusCcc,
        );

        self.choose_codec(address);
        self.send_start(address);

        if self.pipeline.audio_running {
            self.send_state_change_to_other_side(address, StateChange::OtherSideConnected);
        }

        let Some(device) = self.devices.find_by_address_mut(address) else {
            return;
        };
        device.connecting_actively = false;
        device.accepting_audio = true;
        device.state = ConnectionState::Ready;
        let (capabilities, hi_sync_id) = (device.capabilities, device.hi_sync_id);

        self.start_sending_audio(address);
        self.interfaces.callbacks.on_device_available(capabilities, hi_sync_id, *address);
        self.report_connection_state(ProfileConnectionState::Connected, *address);
    }

    pub(super) fn on_gap_event(&mut self, gap_handle: GapHandle, event: GapEvent) {
        let Some(device) = self.devices.find_by_gap_handle_mut(gap_handle) else {
            error!("unknown device: gap_handle={gap_handle} event={event:?}");
            return;
        };
        let address = device.address;

        match event {
            GapEvent::Opened => {
                let tx_mtu = self.interfaces.l2cap.remote_mtu(gap_handle);
                match self.interfaces.l2cap.peer_credit(gap_handle) {
                    Some(credit) => self.init_credit = credit,
                    None => warn!("cannot read initial credits: bd_addr={address}"),
                }
                info!(
                    "GAP_EVT_CONN_OPENED: bd_addr={address} tx_mtu={tx_mtu} init_credit={}",
                    self.init_credit
                );

                device.gap_opened = true;
                if device.connection_update_status == ConnectionUpdateStatus::Completed {
                    self.on_device_ready(&address);
                } else {
                    device.state = ConnectionState::ConnParamNegotiation;
                }
            }
            GapEvent::Closed => {
                info!(
                    "GAP_EVT_CONN_CLOSED: bd_addr={address} accepting_audio={}",
                    device.accepting_audio
                );
                if !device.accepting_audio {
                    // No audio path without the channel.
                    if device.conn_id.is_connected() {
                        self.interfaces.gatt.close(device.conn_id);
                    }
                } else {
                    device.gap_handle = GapHandle::INVALID;
                    device.accepting_audio = false;
                    device.playback_started = false;
                    device.command_acked = false;
                    device.gap_opened = false;
                    // Reopened on the next PSM read.
                    device.state = ConnectionState::SocketOpening;
                }
            }
            GapEvent::DataAvailable => {
                trace!("GAP_EVT_CONN_DATA_AVAIL: bd_addr={address}");
                // Peers only send back statistics, useful for debugging.
                let data = self.interfaces.l2cap.read_data(gap_handle);
                if data.len() < 4 {
                    warn!("Wrong data length");
                    return;
                }
                trace!("stats from the hearing aid:");
                for stats in wire::parse_peer_stats(&data) {
                    trace!("event_counter={} frame_index: {}", stats.event_counter, stats.frame_index);
                }
            }
            GapEvent::TxEmpty => info!("GAP_EVT_TX_EMPTY: bd_addr={address}"),
            GapEvent::Congested => {
                info!("GAP_EVT_CONN_CONGESTED: bd_addr={address}");
                self.interfaces.audio_source.stop();
            }
            GapEvent::Uncongested => info!("GAP_EVT_CONN_UNCONGESTED: bd_addr={address}"),
        }
    }

    pub(super) fn on_read_rssi_complete(&mut self, address: &RawAddress, rssi: Option<i8>) {
        let Some(rssi) = rssi else {
            debug!("rssi read failed: bd_addr={address}");
            return;
        };
        let Some(device) = self.devices.find_by_address_mut(address) else {
            info!("Skipping unknown device {address}");
            return;
        };

        debug!("bd_addr={address} rssi={rssi}");

        if device.read_rssi_count <= 0 {
            error!("bd_addr={address}, invalid read_rssi_count={}", device.read_rssi_count);
            return;
        }

        let first_of_batch = device.read_rssi_count == READ_RSSI_NUM_TRIES;
        let history = &mut device.audio_stats.rssi_history;
        if history.is_empty() {
            history.push_back(RssiLog::default());
        }
        let Some(last) = history.back_mut() else {
            return;
        };
        if first_of_batch {
            last.timestamp = Some(std::time::SystemTime::now());
            info!("store time, bd_addr={address}, rssi={rssi}");
        }
        last.rssi.push(rssi);
        device.read_rssi_count -= 1;
    }

    /// Explicit disconnect requested by the user.
    pub fn disconnect(&mut self, address: RawAddress) {
        let Some(device) = self.devices.find_by_address(&address) else {
            error!("unknown device: bd_addr={address}");
            return;
        };

        let connected = device.accepting_audio;
        let connecting_by_user = device.connecting_actively;

        info!(
            "bd_addr={address} playback_started={} accepting_audio={}",
            device.playback_started, device.accepting_audio
        );

        if connecting_by_user {
            self.interfaces.gatt.cancel_open(self.gatt_if, address, ConnectionType::Direct);
        }
        // Removes the acceptlist entry as well.
        self.interfaces.gatt.cancel_open(self.gatt_if, address, ConnectionType::Background);

        self.send_state_change_to_other_side(&address, StateChange::OtherSideDisconnected);

        self.do_disconnect_clean_up(&address);
        self.devices.remove(&address);

        if !connected {
            if connecting_by_user {
                self.report_connection_state(ProfileConnectionState::Disconnected, address);
            }
            return;
        }

        self.report_connection_state(ProfileConnectionState::Disconnected, address);
        self.stop_audio_if_none_ready();
    }

    pub(super) fn on_gatt_disconnected(&mut self, conn_id: ConnId, address: &RawAddress) {
        let Some(device) = self.devices.find_by_conn_id(conn_id) else {
            error!("unknown device: conn_id={conn_id} bd_addr={address}");
            return;
        };
        let device_address = device.address;

        info!("conn_id={conn_id} bd_addr={address}");

        self.send_state_change_to_other_side(&device_address, StateChange::OtherSideDisconnected);

        self.do_disconnect_clean_up(&device_address);

        let other_connected = self
            .devices
            .find_other_connected_from_set(&device_address)
            .map(|other| other.address);
        if let Some(other) = other_connected {
            info!("Another device from the set is still connected, issuing a direct connection, other_device_bda={other}");
        }

        // Reconnect fast while the other ear streams, otherwise wait for the
        // device to advertise.
        let connection_type =
            if other_connected.is_some() { ConnectionType::Direct } else { ConnectionType::Background };
        if let Some(device) = self.devices.find_by_address_mut(&device_address) {
            device.connecting_actively = other_connected.is_some();
            device.switch_to_background_after_failure = other_connected.is_some();
            device.state = ConnectionState::GattConnecting;
        }
        self.interfaces.gatt.open(self.gatt_if, device_address, connection_type);

        self.report_connection_state(ProfileConnectionState::Disconnected, *address);
        self.stop_audio_if_none_ready();
    }

    fn stop_audio_if_none_ready(&mut self) {
        if self.devices.any_accepting_audio() {
            return;
        }
        info!("No more (0/{}) devices ready", self.devices.len());
        self.do_disconnect_audio_stop();
    }

    /// Releases every link resource of the device and clears its transient
    /// state. The device stays in the registry.
    pub(super) fn do_disconnect_clean_up(&mut self, address: &RawAddress) {
        let Some(device) = self.devices.find_by_address(address) else {
            return;
        };
        if device.connection_update_status != ConnectionUpdateStatus::Completed {
            info!(
                "connection update not completed: status={:?}, bd_addr={address}",
                device.connection_update_status
            );
            if device.connection_update_status == ConnectionUpdateStatus::Started {
                let conn_id = device.conn_id;
                self.on_connection_update_complete(conn_id, None);
            }
        }

        let Some(device) = self.devices.find_by_address_mut(address) else {
            return;
        };
        device.connection_update_status = ConnectionUpdateStatus::None;
        device.gap_opened = false;

        if device.conn_id.is_connected() {
            self.interfaces.gatt.clean_queue(device.conn_id);
            self.interfaces.gatt.close(device.conn_id);
            device.conn_id = ConnId::NONE;
        }

        if device.gap_handle.is_valid() {
            self.interfaces.l2cap.conn_close(device.gap_handle);
            device.gap_handle = GapHandle::INVALID;
        }

        device.accepting_audio = false;
        info!("bd_addr={address} playback_started={}", device.playback_started);
        device.playback_started = false;
        device.command_acked = false;
        device.state = ConnectionState::Disconnected;
    }
}

/// The CCC descriptor of the service changed characteristic.
fn find_service_changed_ccc(address: &RawAddress, service: &Service) -> Option<AttHandle> {
    let characteristic = service.characteristics.iter().find(|c| c.uuid == SERVICE_CHANGED_UUID)?;
    let Some(ccc) = find_ccc_handle(characteristic) else {
        error!("failed to find service changed CCC descriptor: bd_addr={address}");
        return None;
    };
    info!("bd_addr={address} service_changed_ccc={ccc}");
    Some(ccc)
}

fn find_ccc_handle(characteristic: &Characteristic) -> Option<AttHandle> {
    characteristic
        .descriptors
        .iter()
        .find(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID)
        .map(|d| d.handle)
}
