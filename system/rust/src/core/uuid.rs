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

//! 128-bit Bluetooth UUIDs.

use std::fmt;

/// A 128-bit UUID, in the order it is printed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Uuid(pub [u8; 16]);

/// `0000xxxx-0000-1000-8000-00805F9B34FB`
const BASE_UUID: [u8; 16] =
    [0, 0, 0, 0, 0, 0, 0x10, 0, 0x80, 0, 0, 0x80, 0x5f, 0x9b, 0x34, 0xfb];

impl Uuid {
    /// Expands a SIG-assigned 16-bit UUID against the Bluetooth base UUID.
    pub const fn from_16bit(value: u16) -> Self {
        let mut bytes = BASE_UUID;
        bytes[2] = (value >> 8) as u8;
        bytes[3] = value as u8;
        Uuid(bytes)
    }

    /// Parses either a 4-digit short form (`"FDF0"`) or the canonical dashed
    /// 36-character form.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 4 {
            return u16::from_str_radix(s, 16).ok().map(Self::from_16bit);
        }
        let hex: String = s.chars().filter(|&c| c != '-').collect();
        if hex.len() != 32 || s.len() != 36 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(2 * i..2 * i + 2)?, 16).ok()?;
        }
        Some(Uuid(bytes))
    }

    /// Builds a full 128-bit UUID from its big-endian integer form.
    pub const fn from_u128(value: u128) -> Self {
        Uuid(value.to_be_bytes())
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
