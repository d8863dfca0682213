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

//! The session: public operations, event dispatch and the diagnostic dump.
//! The per-device connection flow lives in `connection.rs`, pair
//! coordination in `stereo.rs` and audio delivery in `pipeline.rs`.

use std::fmt::{self, Write};
use std::time::UNIX_EPOCH;

use itertools::Itertools;
use log::{debug, error, info, warn};

use super::codec::{CodecAdapter, CodecId, EncoderFactory};
use super::config::AshaConfig;
use super::device::{Capabilities, ConnectionState, HearingDevice, RssiLog};
use super::events::{AshaEvent, AudioEvent, GattEvent, GATT_MAX_ATTR_LEN};
use super::ids::GattIf;
use super::interfaces::{
    AshaInterfaces, ConnectionType, GattRequest, ProfileConnectionState, ResamplerFactory,
    StoredDevice, WriteType,
};
use super::pipeline::AudioPipeline;
use super::registry::HearingDevices;
use super::VOLUME_UNKNOWN;
use crate::core::address::RawAddress;

pub struct SessionController {
    pub(super) config: AshaConfig,
    pub(super) interfaces: AshaInterfaces,
    pub(super) gatt_if: GattIf,
    pub(super) devices: HearingDevices,
    pub(super) pipeline: AudioPipeline,
    pub(super) current_volume: i8,
    /// Peer credits of the last channel opened, the reference for the
    /// drop decision.
    pub(super) init_credit: u16,
    pub(super) is_iso_running: bool,
    pub(super) needs_parameter_update: bool,
}

impl SessionController {
    pub fn new(
        config: AshaConfig,
        interfaces: AshaInterfaces,
        encoder_factory: EncoderFactory,
        resampler_factory: Option<ResamplerFactory>,
    ) -> Self {
        Self {
            config,
            interfaces,
            gatt_if: GattIf(0),
            devices: HearingDevices::new(),
            pipeline: AudioPipeline::new(CodecAdapter::new(encoder_factory), resampler_factory),
            current_volume: VOLUME_UNKNOWN,
            init_credit: 0,
            is_iso_running: false,
            needs_parameter_update: false,
        }
    }

    /// Registers with GATT and starts listening for ISO traffic. Returns
    /// false if no GATT client could be registered.
    pub fn initialize(&mut self) -> bool {
        let Some(gatt_if) = self.interfaces.gatt.register_app() else {
            error!("Can't start Hearing Aid profile - no gatt clients left!");
            return false;
        };
        self.gatt_if = gatt_if;
        self.interfaces.controller.start_iso_traffic_monitoring();
        info!("hearing aid profile registered, gatt_if={gatt_if}");
        true
    }

    pub fn config(&self) -> &AshaConfig {
        &self.config
    }

    pub fn devices(&self) -> &HearingDevices {
        &self.devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn is_audio_running(&self) -> bool {
        self.pipeline.audio_running
    }

    pub fn codec_in_use(&self) -> Option<CodecId> {
        self.pipeline.codec_in_use
    }

    pub fn current_volume(&self) -> i8 {
        self.current_volume
    }

    /// User initiated connection.
    pub fn connect(&mut self, address: RawAddress) {
        info!("bd_addr={address}");
        self.devices.add(HearingDevice::new(address, true));
        let Some(device) = self.devices.find_by_address_mut(&address) else {
            return;
        };
        if device.conn_id.is_connected() || device.connecting_actively {
            warn!(
                "bd_addr={address} already connected or connecting, conn_id={}",
                device.conn_id
            );
            return;
        }
        device.connecting_actively = true;
        device.state = ConnectionState::GattConnecting;
        self.interfaces.gatt.open(self.gatt_if, address, ConnectionType::Direct);
    }

    /// Waits for the device to show up, without scanning aggressively.
    pub fn add_to_acceptlist(&mut self, address: RawAddress) {
        info!("bd_addr={address}");
        self.devices.add(HearingDevice::new(address, true));
        let Some(device) = self.devices.find_by_address_mut(&address) else {
            return;
        };
        if device.conn_id.is_connected() {
            debug!("bd_addr={address} already connected");
            return;
        }
        device.state = ConnectionState::GattConnecting;
        self.interfaces.gatt.open(self.gatt_if, address, ConnectionType::Background);
    }

    /// Reloads a device paired in a previous run.
    pub fn add_from_storage(&mut self, stored: StoredDevice) {
        info!(
            "bd_addr={} hi_sync_id=0x{:x} is_acceptlisted={}",
            stored.address, stored.properties.hi_sync_id, stored.is_acceptlisted
        );
        if stored.is_acceptlisted {
            let mut device =
                HearingDevice::from_storage(stored.address, stored.properties, stored.handles);
            device.state = ConnectionState::GattConnecting;
            if self.devices.add(device) {
                self.interfaces.gatt.open(self.gatt_if, stored.address, ConnectionType::Background);
            } else {
                warn!("{} is already known, not reconnecting", stored.address);
            }
        }

        self.interfaces.callbacks.on_device_available(
            stored.properties.capabilities,
            stored.properties.hi_sync_id,
            stored.address,
        );
    }

    pub fn set_volume(&mut self, volume: i8) {
        debug!("{volume}");
        self.current_volume = volume;
        for device in self.devices.iter().filter(|d| d.accepting_audio) {
            self.interfaces.gatt.write_characteristic(
                device.conn_id,
                device.handles.volume,
                vec![volume as u8],
                WriteType::WithoutResponse,
                GattRequest::Volume,
            );
        }
    }

    /// Tears everything down. The controller can be dropped afterwards.
    pub fn clean_up(&mut self) {
        self.interfaces.audio_source.stop();
        self.pipeline.audio_running = false;
        self.interfaces.gatt.deregister_app(self.gatt_if);
        for address in self.devices.addresses() {
            self.do_disconnect_clean_up(&address);
        }
        self.devices.clear();
        self.pipeline.reset_asrc();
        self.pipeline.encoder.release();
    }

    /// Single entry point for everything the rest of the stack reports.
    pub fn handle_event(&mut self, event: AshaEvent) {
        match event {
            AshaEvent::Gatt(event) => self.handle_gatt_event(event),
            AshaEvent::Gap { gap_handle, event } => self.on_gap_event(gap_handle, event),
            AshaEvent::Encryption { address, success } => {
                self.on_encryption_complete(&address, success)
            }
            AshaEvent::IsoTrafficActive(is_active) => self.on_iso_traffic_event(is_active),
            AshaEvent::RssiRead { address, rssi } => self.on_read_rssi_complete(&address, rssi),
            AshaEvent::Audio(AudioEvent::DataReady(data)) => self.on_audio_data_ready_resample(data),
            AshaEvent::Audio(AudioEvent::Suspend(stop_ticks)) => self.on_audio_suspend(stop_ticks),
            AshaEvent::Audio(AudioEvent::Resume(start_ticks)) => self.on_audio_resume(start_ticks),
        }
    }

    fn handle_gatt_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::Open { status, conn_id, address, mtu } => {
                debug!("open: bd_addr={address} conn_id={conn_id} mtu={mtu}");
                self.on_gatt_connected(status, conn_id, address)
            }
            GattEvent::Close { conn_id, address } => self.on_gatt_disconnected(conn_id, &address),
            GattEvent::SearchComplete { conn_id, status } => {
                self.on_service_search_complete(conn_id, status)
            }
            GattEvent::Notification { conn_id, handle, value, is_notify } => {
                if !is_notify || value.len() > GATT_MAX_ATTR_LEN {
                    error!(
                        "rejected notification. is_notify={is_notify}, len={}",
                        value.len()
                    );
                    return;
                }
                self.on_notification(conn_id, handle, &value)
            }
            GattEvent::ConnectionUpdate { conn_id, status, interval } => {
                self.on_connection_update_complete(conn_id, Some((status, interval)))
            }
            GattEvent::ServiceChanged { address } => self.on_service_changed(&address),
            GattEvent::ServiceDiscoveryDone { address } => self.on_service_discovery_done(&address),
            GattEvent::PhyUpdate { conn_id, tx_phy, rx_phy, status } => {
                self.on_phy_update(conn_id, tx_phy, rx_phy, status)
            }
            GattEvent::ReadComplete { conn_id, status, handle, value, request } => match request {
                GattRequest::ReadOnlyProperties => {
                    self.on_read_only_properties_read(conn_id, status, &value)
                }
                GattRequest::Psm => self.on_psm_read(conn_id, status, &value),
                other => debug!("unexpected read completion {other:?} handle={handle}"),
            },
            GattEvent::WriteComplete { conn_id, status, handle, request } => {
                if !status.is_success() {
                    error!("{request:?} write failed: handle={handle}, conn_id={conn_id}, status={status}");
                    return;
                }
                if request == GattRequest::StartCommand {
                    self.on_start_command_written(conn_id);
                }
            }
        }
    }

    pub(super) fn report_connection_state(
        &self,
        state: ProfileConnectionState,
        address: RawAddress,
    ) {
        self.interfaces.callbacks.on_connection_state(state, address);
    }

    /// Human readable state, for bug reports.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_dump(&mut out);
        out
    }

    fn write_dump(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "Hearing Aid Manager:")?;
        writeln!(
            out,
            "  audio_running={} codec_in_use={:?} data_interval_ms={} volume={}",
            self.pipeline.audio_running,
            self.pipeline.codec_in_use,
            self.config.data_interval_ms,
            self.current_volume
        )?;
        for device in self.devices.iter() {
            let stats = &device.audio_stats;
            writeln!(
                out,
                "  {} {}connected\n    {} {} 0x{:016x}",
                device.address,
                if device.accepting_audio { "" } else { "not " },
                if device.capabilities.contains(Capabilities::BINAURAL) {
                    "binaural"
                } else {
                    "monaural"
                },
                device.side().name(),
                device.hi_sync_id
            )?;
            writeln!(out, "    State                                                  : {:?}", device.state())?;
            writeln!(
                out,
                "    Trigger dropped counts                                 : {}",
                stats.trigger_drop_count
            )?;
            writeln!(
                out,
                "    Packet dropped counts                                  : {}",
                stats.packet_drop_count
            )?;
            writeln!(
                out,
                "    Packet counts (send/flush)                             : {} / {}",
                stats.packet_send_count, stats.packet_flush_count
            )?;
            writeln!(
                out,
                "    Frame counts (sent/flush)                              : {} / {}",
                stats.frame_send_count, stats.frame_flush_count
            )?;
            write_rssi(out, device)?;
        }
        Ok(())
    }
}

fn write_rssi(out: &mut impl Write, device: &HearingDevice) -> fmt::Result {
    let history = &device.audio_stats.rssi_history;
    if history.is_empty() {
        return writeln!(out, "  No RSSI history for {}:", device.address);
    }
    writeln!(out, "  RSSI history for {}:", device.address)?;
    writeln!(out, "    Time of RSSI    0.0  0.1  0.2  0.3  0.4  0.5  0.6  0.7  0.8  0.9")?;
    for log in history.iter().take_while(|log| !log.rssi.is_empty()) {
        writeln!(
            out,
            "    {}: {}",
            format_timestamp(log),
            log.rssi.iter().map(|rssi| format!(" {rssi:04}")).join("")
        )?;
    }
    Ok(())
}

/// `HH:MM:SS.mmm`, UTC.
fn format_timestamp(log: &RssiLog) -> String {
    let Some(since_epoch) = log.timestamp.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) else {
        return "UNKNOWN TIME".to_string();
    };
    let secs = since_epoch.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        since_epoch.subsec_millis()
    )
}
