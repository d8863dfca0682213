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

//! Codec adapter: owns the pair of streaming G.722 encoders used for the
//! whole session (one per output side, never per device).

use log::{error, info, warn};
use num_derive::{FromPrimitive, ToPrimitive};

use super::device::Side;

/// Codec identifiers as carried in the START command. The device codec
/// bitmask uses `1 << id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CodecId {
    G722At16Khz = 0x01,
    G722At24Khz = 0x02,
}

impl CodecId {
    /// The bit representing this codec in a peer's codec bitmask.
    pub fn mask_bit(self) -> u16 {
        1 << (self as u8)
    }

    /// True if `codecs` advertises this codec.
    pub fn is_in(self, codecs: u16) -> bool {
        codecs & self.mask_bit() != 0
    }

    pub fn sample_rate(self) -> u32 {
        match self {
            CodecId::G722At16Khz => 16000,
            CodecId::G722At24Khz => 24000,
        }
    }
}

/// Stream configuration handed to the audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfiguration {
    pub sample_rate: u32,
    pub bits_per_sample: u8,
    pub data_interval_ms: u16,
}

impl CodecConfiguration {
    pub fn new(codec: Option<CodecId>, data_interval_ms: u16) -> Self {
        Self {
            sample_rate: codec.map_or(16000, CodecId::sample_rate),
            bits_per_sample: 16,
            data_interval_ms,
        }
    }
}

/// G.722 has a fixed 4:1 compression ratio over 16-bit samples.
const COMPRESSION_RATIO: u32 = 4;
const BITS_PER_SAMPLE: u32 = 16;

/// Size in bytes of the compressed audio generated for each connection
/// interval. Codec "none" is treated as the 16kHz baseline.
pub fn compressed_packet_size(codec: Option<CodecId>, interval_ms: u16) -> usize {
    let sample_rate = codec.map_or(16000, CodecId::sample_rate);
    (sample_rate * u32::from(interval_ms) * (BITS_PER_SAMPLE / 8) / COMPRESSION_RATIO / 1000)
        as usize
}

/// Bit rate the encoders are configured for.
pub const G722_BIT_RATE: u32 = 64000;

/// Streaming contract of the external G.722 library. The encoder keeps
/// state between calls; dropping it releases that state.
pub trait G722Encoder {
    /// Encodes `pcm` (an even number of samples) and appends the packed
    /// output to `out`. Returns the number of bytes produced.
    fn encode(&mut self, pcm: &[i16], out: &mut Vec<u8>) -> usize;
}

/// Creates a fresh encoder configured for the given bit rate.
pub type EncoderFactory = Box<dyn Fn(u32) -> Box<dyn G722Encoder>>;

struct EncoderPair {
    left: Box<dyn G722Encoder>,
    right: Box<dyn G722Encoder>,
}

/// Owns the left/right encoder state for the session.
pub struct CodecAdapter {
    factory: EncoderFactory,
    state: Option<EncoderPair>,
}

impl CodecAdapter {
    pub fn new(factory: EncoderFactory) -> Self {
        Self { factory, state: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Creates both encoders. A second call without `release` is a no-op.
    pub fn init(&mut self) {
        if self.state.is_some() {
            warn!("encoder already initialized");
            return;
        }
        self.state = Some(EncoderPair {
            left: (self.factory)(G722_BIT_RATE),
            right: (self.factory)(G722_BIT_RATE),
        });
    }

    pub fn release(&mut self) {
        if self.state.take().is_some() {
            info!("encoder released");
        }
    }

    /// Discards any mid-frame state by recreating both encoders.
    pub fn reset(&mut self) {
        self.release();
        self.init();
    }

    /// Encodes one channel's samples. Returns `None` when the encoder is not
    /// initialized or the sample count is odd; the encoder is not touched in
    /// either case.
    pub fn encode(&mut self, side: Side, pcm: &[i16]) -> Option<Vec<u8>> {
        if pcm.len() % 2 != 0 {
            error!("num_samples is not even: {}", pcm.len());
            return None;
        }
        let Some(pair) = self.state.as_mut() else {
            error!("encoder not initialized");
            return None;
        };
        let encoder = match side {
            Side::Left => &mut pair.left,
            Side::Right => &mut pair.right,
        };
        // 8 bits per two samples at 64kbit/s
        let mut out = Vec::with_capacity(pcm.len() / 2 + 1);
        encoder.encode(pcm, &mut out);
        Some(out)
    }
}
