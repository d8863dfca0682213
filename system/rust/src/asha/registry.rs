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

//! The set of known hearing aids. There are practically one or two of
//! them, so every lookup is a linear scan.

use log::debug;

use super::device::{
    HearingDevice, RssiLog, MAX_RSSI_HISTORY, PERIOD_TO_READ_RSSI_IN_INTERVALS,
    READ_RSSI_NUM_TRIES,
};
use super::ids::{ConnId, GapHandle};
use crate::core::address::RawAddress;

#[derive(Debug, Default)]
pub struct HearingDevices {
    devices: Vec<HearingDevice>,
}

impl HearingDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `device` unless its address is already known. Returns true if
    /// it was inserted.
    pub fn add(&mut self, device: HearingDevice) -> bool {
        if self.find_by_address(&device.address).is_some() {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub fn remove(&mut self, address: &RawAddress) -> Option<HearingDevice> {
        let index = self.devices.iter().position(|d| d.address == *address)?;
        Some(self.devices.remove(index))
    }

    pub fn find_by_address(&self, address: &RawAddress) -> Option<&HearingDevice> {
        self.devices.iter().find(|d| d.address == *address)
    }

    pub fn find_by_address_mut(&mut self, address: &RawAddress) -> Option<&mut HearingDevice> {
        self.devices.iter_mut().find(|d| d.address == *address)
    }

    pub fn find_by_conn_id(&self, conn_id: ConnId) -> Option<&HearingDevice> {
        if !conn_id.is_connected() {
            return None;
        }
        self.devices.iter().find(|d| d.conn_id == conn_id)
    }

    pub fn find_by_conn_id_mut(&mut self, conn_id: ConnId) -> Option<&mut HearingDevice> {
        if !conn_id.is_connected() {
            return None;
        }
        self.devices.iter_mut().find(|d| d.conn_id == conn_id)
    }

    pub fn find_by_gap_handle(&self, gap_handle: GapHandle) -> Option<&HearingDevice> {
        if !gap_handle.is_valid() {
            return None;
        }
        self.devices.iter().find(|d| d.gap_handle == gap_handle)
    }

    pub fn find_by_gap_handle_mut(&mut self, gap_handle: GapHandle) -> Option<&mut HearingDevice> {
        if !gap_handle.is_valid() {
            return None;
        }
        self.devices.iter_mut().find(|d| d.gap_handle == gap_handle)
    }

    /// The other member of `address`'s pair, if it is GATT-connected.
    pub fn find_other_connected_from_set(&self, address: &RawAddress) -> Option<&HearingDevice> {
        let hi_sync_id = self.find_by_address(address)?.hi_sync_id;
        if hi_sync_id == 0 {
            return None;
        }
        self.devices.iter().find(|d| {
            d.hi_sync_id == hi_sync_id && d.address != *address && d.conn_id.is_connected()
        })
    }

    /// Devices sharing a non-zero `hi_sync_id` with `address`, excluding it.
    pub fn siblings_of<'a>(
        &'a self,
        address: &'a RawAddress,
        hi_sync_id: u64,
    ) -> impl Iterator<Item = &'a HearingDevice> + 'a {
        self.devices
            .iter()
            .filter(move |d| hi_sync_id != 0 && d.hi_sync_id == hi_sync_id && d.address != *address)
    }

    /// Addresses of the devices sharing `address`'s non-zero `hi_sync_id`.
    pub fn sibling_addresses(&self, address: &RawAddress) -> Vec<RawAddress> {
        let Some(hi_sync_id) = self.find_by_address(address).map(|d| d.hi_sync_id) else {
            return vec![];
        };
        self.siblings_of(address, hi_sync_id).map(|d| d.address).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HearingDevice> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HearingDevice> {
        self.devices.iter_mut()
    }

    pub fn addresses(&self) -> Vec<RawAddress> {
        self.devices.iter().map(|d| d.address).collect()
    }

    pub fn any_accepting_audio(&self) -> bool {
        self.devices.iter().any(|d| d.accepting_audio)
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Arms a new batch of RSSI reads on every device that finished its
    /// previous batch, spacing the first read of each device half a period
    /// apart so the controller does not get the commands in a burst.
    pub fn start_rssi_log(&mut self) {
        let mut start_interval_count = 0;

        for d in self.devices.iter_mut() {
            debug!("bd_addr={} read_rssi_count={}", d.address, d.read_rssi_count);

            if d.read_rssi_count <= 0 {
                d.read_rssi_count = READ_RSSI_NUM_TRIES;
                d.num_intervals_since_last_rssi_read = start_interval_count;

                start_interval_count += PERIOD_TO_READ_RSSI_IN_INTERVALS / 2;
                start_interval_count %= PERIOD_TO_READ_RSSI_IN_INTERVALS;

                let history = &mut d.audio_stats.rssi_history;
                if history.len() >= MAX_RSSI_HISTORY {
                    history.pop_front();
                }
                history.push_back(RssiLog::default());
            }
        }
    }
}
