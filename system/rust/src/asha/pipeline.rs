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

//! Audio delivery: codec choice, START/STOP, frame encoding, backpressure
//! and packetization.

use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::time::Instant;

use super::codec::{compressed_packet_size, CodecAdapter, CodecConfiguration, CodecId};
use super::config::INTERVAL_10_MS;
use super::device::{Side, PERIOD_TO_READ_RSSI_IN_INTERVALS};
use super::events::TicksCallback;
use super::interfaces::{
    GattRequest, Resampler, ResamplerFactory, ResamplerParameters, WriteType,
};
use super::session::SessionController;
use super::wire::{self, ControlPointCommand, AUDIOTYPE_UNKNOWN};
use super::{ADD_RENDER_DELAY_INTERVALS, VOLUME_MIN, VOLUME_UNKNOWN};
use crate::core::address::RawAddress;

/// Minimum time between two synchronized drops.
pub const DROP_COOLDOWN: Duration = Duration::from_secs(60);

/// Session-wide audio state. Per-device audio flags live on the devices.
pub(super) struct AudioPipeline {
    pub(super) encoder: CodecAdapter,
    resampler_factory: Option<ResamplerFactory>,
    resampler: Option<Box<dyn Resampler>>,
    pub(super) seq_counter: u8,
    pub(super) codec_in_use: Option<CodecId>,
    pub(super) audio_running: bool,
    /// Starts at construction, so the first drop waits a full cooldown.
    pub(super) last_drop: Instant,
}

impl AudioPipeline {
    pub(super) fn new(encoder: CodecAdapter, resampler_factory: Option<ResamplerFactory>) -> Self {
        Self {
            encoder,
            resampler_factory,
            resampler: None,
            seq_counter: 0,
            codec_in_use: None,
            audio_running: false,
            last_drop: Instant::now(),
        }
    }

    pub(super) fn reset_asrc(&mut self) {
        if self.resampler.take().is_some() {
            info!("Resetting Asha resampler");
        }
    }

    /// True when the last synchronized drop is at least [`DROP_COOLDOWN`] old.
    pub(super) fn is_below_drop_frequency(&self, now: Instant) -> bool {
        let droppable = now.saturating_duration_since(self.last_drop) >= DROP_COOLDOWN;
        debug!("IsBelowDropFrequency {droppable}");
        droppable
    }
}

/// Two sides are equally behind when their peer credits are within half of
/// the credits granted at channel open.
fn credits_close(target: u16, other: u16, init_credit: u16) -> bool {
    i32::from(target.abs_diff(other)) < i32::from(init_credit) / 2 - 1
}

/// Splits interleaved 16-bit little-endian stereo PCM into left and right
/// samples, attenuated by one bit. Without `stereo` both outputs carry the
/// same down-mix.
fn split_channels(data: &[u8], stereo: bool) -> (Vec<i16>, Vec<i16>) {
    let frames = data.chunks_exact(4).map(|sample| {
        let left = i16::from_le_bytes([sample[0], sample[1]]) >> 1;
        let right = i16::from_le_bytes([sample[2], sample[3]]) >> 1;
        (left, right)
    });
    if stereo {
        frames.unzip()
    } else {
        frames
            .map(|(left, right)| {
                let mono = ((i32::from(left) + i32::from(right)) >> 1) as i16;
                (mono, mono)
            })
            .unzip()
    }
}

impl SessionController {
    /// Picks the session codec from what every member of the set supports.
    /// Once chosen it sticks until audio stops completely.
    pub(super) fn choose_codec(&mut self, address: &RawAddress) {
        if self.pipeline.codec_in_use.is_some() {
            return;
        }
        let Some(device) = self.devices.find_by_address(address) else {
            return;
        };

        let codecs = self
            .devices
            .siblings_of(address, device.hi_sync_id)
            .fold(device.codecs, |codecs, sibling| codecs & sibling.codecs);

        self.pipeline.codec_in_use = if CodecId::G722At24Khz.is_in(codecs)
            && self.interfaces.controller.supports_ble_2m_phy()
            && self.config.data_interval_ms == INTERVAL_10_MS
        {
            Some(CodecId::G722At24Khz)
        } else if CodecId::G722At16Khz.is_in(codecs) {
            Some(CodecId::G722At16Khz)
        } else {
            None
        };
        info!("codec_in_use={:?} codecs=0x{codecs:x}", self.pipeline.codec_in_use);
    }

    pub(super) fn send_start(&mut self, address: &RawAddress) {
        let Some(device) = self.devices.find_by_address(address) else {
            return;
        };

        if !self.pipeline.audio_running {
            if !device.playback_started {
                info!("Skip Send Start since audio is not running, bd_addr={address}");
            } else {
                error!("Audio not running but Playback has started, bd_addr={address}");
            }
            return;
        }

        if device.playback_started {
            error!("Playback already started, skip send Start cmd, bd_addr={address}");
            return;
        }

        let volume =
            if self.current_volume == VOLUME_UNKNOWN { VOLUME_MIN } else { self.current_volume };
        let other_side = self.other_side_stream_status(address);
        let command = ControlPointCommand::Start {
            codec: self.pipeline.codec_in_use.map_or(0, |codec| codec as u8),
            audio_type: AUDIOTYPE_UNKNOWN,
            volume,
            other_side,
        };
        info!(
            "send Start cmd, volume={volume}, audio type=0x{AUDIOTYPE_UNKNOWN:x}, bd_addr={address}, other side streaming={other_side:?}"
        );

        let (conn_id, control_point) = (device.conn_id, device.handles.audio_control_point);
        if let Some(device) = self.devices.find_by_address_mut(address) {
            device.command_acked = false;
        }
        self.interfaces.gatt.write_characteristic(
            conn_id,
            control_point,
            command.to_bytes(),
            WriteType::WithResponse,
            GattRequest::StartCommand,
        );
    }

    /// Starts the audio source for the first ready device. Later devices
    /// join the running stream.
    pub(super) fn start_sending_audio(&mut self, address: &RawAddress) {
        info!("bd_addr={address}");
        if self.pipeline.encoder.is_initialized() {
            return;
        }
        let Some(render_delay) = self.devices.find_by_address(address).map(|d| d.render_delay)
        else {
            return;
        };

        self.pipeline.encoder.init();
        self.pipeline.seq_counter = 0;

        let interval = self.config.data_interval_ms;
        let delay_report_ms = if render_delay != 0 {
            render_delay + ADD_RENDER_DELAY_INTERVALS * interval
        } else {
            0
        };
        self.interfaces
            .audio_source
            .start(CodecConfiguration::new(self.pipeline.codec_in_use, interval), delay_report_ms);
    }

    pub(super) fn on_audio_suspend(&mut self, stop_ticks: TicksCallback) {
        if !self.pipeline.audio_running {
            warn!("Unexpected audio suspend");
            return;
        }
        info!("audio_running={}", self.pipeline.audio_running);

        self.pipeline.reset_asrc();
        self.pipeline.audio_running = false;
        stop_ticks();

        let stop = ControlPointCommand::Stop.to_bytes();
        for device in self.devices.iter_mut().filter(|d| d.accepting_audio) {
            if !device.playback_started {
                warn!("Playback not started, skip send Stop cmd, bd_addr={}", device.address);
                continue;
            }
            info!("send Stop cmd, bd_addr={}", device.address);
            device.playback_started = false;
            device.command_acked = false;
            self.interfaces.gatt.write_characteristic(
                device.conn_id,
                device.handles.audio_control_point,
                stop.clone(),
                WriteType::WithResponse,
                GattRequest::StopCommand,
            );
        }
    }

    pub(super) fn on_audio_resume(&mut self, start_ticks: TicksCallback) {
        if self.pipeline.audio_running {
            warn!("Unexpected Audio Resume");
            return;
        }
        info!("audio_running={}", self.pipeline.audio_running);

        for address in self.devices.addresses() {
            if !self.devices.find_by_address(&address).is_some_and(|d| d.accepting_audio) {
                continue;
            }
            self.pipeline.audio_running = true;
            self.send_start(&address);
        }

        if !self.pipeline.audio_running {
            info!("No device (0/{}) ready to start", self.devices.len());
            return;
        }

        self.configure_asrc();

        self.pipeline.encoder.reset();
        self.pipeline.seq_counter = 0;

        start_ticks();
    }

    fn configure_asrc(&mut self) {
        if !self.config.asrc_enabled {
            info!("Asha resampling disabled");
            return;
        }
        if self.pipeline.resampler.is_some() {
            return;
        }
        let Some(factory) = self.pipeline.resampler_factory.as_ref() else {
            warn!("Asha resampling enabled without a resampler");
            return;
        };
        info!("Configuring Asha resampler");
        let sample_rate = match self.pipeline.codec_in_use {
            Some(CodecId::G722At24Khz) => 24000,
            _ => 16000,
        };
        self.pipeline.resampler = Some(factory(ResamplerParameters {
            channels: 2,
            sample_rate,
            bit_depth: 16,
            interval_us: u32::from(self.config.data_interval_ms) * 1000,
        }));
    }

    pub(super) fn on_audio_data_ready_resample(&mut self, data: Vec<u8>) {
        let Some(resampler) = self.pipeline.resampler.as_mut() else {
            self.on_audio_data_ready(&data);
            return;
        };
        for chunk in resampler.run(&data) {
            self.on_audio_data_ready(&chunk);
        }
    }

    /// One PCM frame from the audio source.
    pub(super) fn on_audio_data_ready(&mut self, data: &[u8]) {
        let num_samples = data.len() / 4;
        if num_samples % 2 != 0 {
            // G.722 encodes sample pairs.
            error!("num_samples is not even: {num_samples}");
            return;
        }

        let mut left = None;
        let mut right = None;
        for device in self.devices.iter().filter(|d| d.accepting_audio) {
            if device.is_left() {
                left = Some(device.address);
            } else {
                right = Some(device.address);
            }
        }

        if left.is_none() && right.is_none() {
            warn!("No more (0/{}) devices ready", self.devices.len());
            self.do_disconnect_audio_stop();
            return;
        }

        let (chan_left, chan_right) = split_channels(data, left.is_some() && right.is_some());
        let threshold = self.config.l2cap_flush_threshold();
        let now = Instant::now();

        let mut need_drop = false;
        let mut encoded_left = Vec::new();
        if let Some(address) = left {
            encoded_left = self.pipeline.encoder.encode(Side::Left, &chan_left).unwrap_or_default();
            need_drop |= self.check_backlog(&address, right.as_ref(), threshold, now);
            self.check_and_do_rssi_read(&address);
        }
        let mut encoded_right = Vec::new();
        if let Some(address) = right {
            encoded_right =
                self.pipeline.encoder.encode(Side::Right, &chan_right).unwrap_or_default();
            need_drop |= self.check_backlog(&address, left.as_ref(), threshold, now);
            self.check_and_do_rssi_read(&address);
        }

        let sides = [(left, &encoded_left), (right, &encoded_right)];

        if need_drop {
            self.pipeline.last_drop = now;
            for (address, _) in sides {
                if let Some(device) = address.and_then(|a| self.devices.find_by_address_mut(&a)) {
                    device.audio_stats.packet_drop_count += 1;
                }
            }
            return;
        }

        let packet_size =
            compressed_packet_size(self.pipeline.codec_in_use, self.config.data_interval_ms).max(1);
        let encoded_size = encoded_left.len().max(encoded_right.len());
        for offset in (0..encoded_size).step_by(packet_size) {
            for (address, encoded) in sides {
                let Some(address) = address else {
                    continue;
                };
                if let Some(device) = self.devices.find_by_address_mut(&address) {
                    device.audio_stats.packet_send_count += 1;
                }
                let end = (offset + packet_size).min(encoded.len());
                self.send_audio(&address, encoded.get(offset..end).unwrap_or_default());
            }
            self.pipeline.seq_counter = self.pipeline.seq_counter.wrapping_add(1);
        }

        for (address, _) in sides {
            if let Some(device) = address.and_then(|a| self.devices.find_by_address_mut(&a)) {
                device.audio_stats.frame_send_count += 1;
            }
        }
    }

    /// Handles a backed up channel. Returns true if the whole frame should
    /// be dropped on both sides; otherwise the stale packets of this side
    /// are flushed and the new frame goes out.
    fn check_backlog(
        &mut self,
        address: &RawAddress,
        other: Option<&RawAddress>,
        threshold: usize,
        now: Instant,
    ) -> bool {
        let Some(gap_handle) = self.devices.find_by_address(address).map(|d| d.gap_handle) else {
            return false;
        };
        let packets_in_chans = self.interfaces.l2cap.queued_packets(gap_handle);
        if packets_in_chans <= threshold {
            return false;
        }

        let drop_frame = self.need_to_drop_packet(address, other)
            && self.pipeline.is_below_drop_frequency(now);
        let Some(device) = self.devices.find_by_address_mut(address) else {
            return false;
        };
        if drop_frame {
            info!("{address} triggers dropping, {packets_in_chans} packets in channel");
            device.audio_stats.trigger_drop_count += 1;
        } else {
            info!("{address} skipping {packets_in_chans} packets");
            device.audio_stats.packet_flush_count += packets_in_chans;
            device.audio_stats.frame_flush_count += 1;
            let buffers_left = self.interfaces.l2cap.flush_all(gap_handle);
            if buffers_left != 0 {
                warn!(
                    "Unable to flush L2CAP ALL channel peer:{address} gap_handle:{gap_handle} buffers_left:{buffers_left}"
                );
            }
        }
        self.devices.start_rssi_log();
        drop_frame
    }

    /// Compares the peer credits of both sides. Drops when they are close,
    /// when the other side is gone, or when a credit cannot be read.
    fn need_to_drop_packet(&self, target: &RawAddress, other: Option<&RawAddress>) -> bool {
        let Some(other) = other else {
            debug!("other side not connected to profile");
            return true;
        };
        let credit = |address: &RawAddress| {
            self.devices
                .find_by_address(address)
                .and_then(|d| self.interfaces.l2cap.peer_credit(d.gap_handle))
        };

        let Some(target_credit) = credit(target) else {
            error!("Get target side credit value fail.");
            return true;
        };
        let Some(other_credit) = credit(other) else {
            error!("Get other side credit value fail.");
            return true;
        };
        debug!(
            "Target({target}) Credit: {target_credit}, Other({other}) Credit: {other_credit}, Init Credit: {}",
            self.init_credit
        );
        credits_close(target_credit, other_credit, self.init_credit)
    }

    fn send_audio(&self, address: &RawAddress, payload: &[u8]) {
        let Some(device) = self.devices.find_by_address(address) else {
            return;
        };
        if !device.can_stream() {
            warn!(
                "Playback stalled: bd_addr={address} cmd send={} cmd acked={}",
                device.playback_started, device.command_acked
            );
            return;
        }

        trace!("bd_addr={address} packet_size={}", payload.len());
        let packet = wire::audio_packet(self.pipeline.seq_counter, payload);
        if let Err(e) = self.interfaces.l2cap.write_data(device.gap_handle, packet) {
            error!("Error sending data: {e}");
        }
    }

    fn check_and_do_rssi_read(&mut self, address: &RawAddress) {
        let Some(device) = self.devices.find_by_address_mut(address) else {
            return;
        };
        if device.read_rssi_count <= 0 {
            return;
        }
        device.num_intervals_since_last_rssi_read += 1;
        if device.num_intervals_since_last_rssi_read >= PERIOD_TO_READ_RSSI_IN_INTERVALS {
            device.num_intervals_since_last_rssi_read = 0;
            debug!("bd_addr={address}");
            if !self.interfaces.link.read_rssi(*address) {
                warn!("cannot read rssi: bd_addr={address}");
            }
        }
    }

    /// No device is left to stream to.
    pub(super) fn do_disconnect_audio_stop(&mut self) {
        self.interfaces.audio_source.stop();
        self.pipeline.audio_running = false;
        self.pipeline.encoder.release();
        self.current_volume = VOLUME_UNKNOWN;
        self.pipeline.reset_asrc();
        self.pipeline.codec_in_use = None;
    }
}
