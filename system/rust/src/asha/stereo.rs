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

//! Keeping the two members of a binaural pair informed of each other.

use log::{debug, info};

use super::device::ConnectionState;
use super::interfaces::{ConnectionType, GattRequest, WriteType};
use super::session::SessionController;
use super::wire::{ControlPointCommand, OtherSideStatus, StateChange};
use crate::core::address::RawAddress;

impl SessionController {
    /// Once one side connects, the other side of the set is connected
    /// directly instead of waiting for it to advertise. Failing that, it
    /// goes back to the acceptlist.
    pub(super) fn promote_siblings(&mut self, address: &RawAddress, hi_sync_id: u64) {
        let idle: Vec<RawAddress> = self
            .devices
            .siblings_of(address, hi_sync_id)
            .filter(|d| !d.conn_id.is_connected() && !d.connecting_actively)
            .map(|d| d.address)
            .collect();
        for sibling in idle {
            let Some(device) = self.devices.find_by_address_mut(&sibling) else {
                continue;
            };
            info!("Connecting other side {sibling}");
            device.connecting_actively = true;
            device.switch_to_background_after_failure = true;
            device.state = ConnectionState::GattConnecting;
            self.interfaces.gatt.open(self.gatt_if, sibling, ConnectionType::Direct);
        }
    }

    /// Whether the other member of the set is currently receiving audio,
    /// as announced in START.
    pub(super) fn other_side_stream_status(&self, address: &RawAddress) -> OtherSideStatus {
        let Some(device) = self.devices.find_by_address(address) else {
            return OtherSideStatus::NotStreaming;
        };
        let other = self
            .devices
            .iter()
            .find(|d| d.hi_sync_id != 0 && d.hi_sync_id == device.hi_sync_id && d.address != *address);
        match other {
            Some(other) if self.pipeline.audio_running && other.conn_id.is_connected() => {
                OtherSideStatus::Streaming
            }
            _ => OtherSideStatus::NotStreaming,
        }
    }

    /// Writes a state change to the device's control point, unless the
    /// device is in no position to take it.
    pub(super) fn send_state_change(&self, address: &RawAddress, change: StateChange) {
        let Some(device) = self.devices.find_by_address(address) else {
            return;
        };
        if !device.conn_id.is_connected() {
            return;
        }
        if device.service_changed_rcvd
            || matches!(
                device.state,
                ConnectionState::ServiceDiscovery | ConnectionState::CharacteristicResolution
            )
            || !device.handles.audio_control_point.is_resolved()
        {
            debug!("{address} discovery in progress, dropped state change {change:?}");
            return;
        }

        debug!("{address} {change:?}");
        self.interfaces.gatt.write_characteristic(
            device.conn_id,
            device.handles.audio_control_point,
            ControlPointCommand::StateChange(change).to_bytes(),
            WriteType::WithoutResponse,
            GattRequest::StateChange,
        );
    }

    pub(super) fn send_state_change_to_other_side(
        &self,
        address: &RawAddress,
        change: StateChange,
    ) {
        for sibling in self.devices.sibling_addresses(address) {
            self.send_state_change(&sibling, change);
        }
    }
}
