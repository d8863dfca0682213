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

//! Link-layer peer addresses.

use std::fmt;
use std::str::FromStr;

/// A Bluetooth device address, stored in the order it is printed
/// (most significant byte first).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawAddress(pub [u8; 6]);

impl RawAddress {
    /// The all-zero address, never a valid peer.
    pub const EMPTY: Self = RawAddress([0; 6]);

    /// True if this is the all-zero address.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Returned when a string is not of the form `xx:xx:xx:xx:xx:xx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParseError(pub String);

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bluetooth address: {:?}", self.0)
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for RawAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| AddressParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(AddressParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(RawAddress(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let address = RawAddress([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]);
        assert_eq!(address.to_string(), "00:1a:7d:da:71:13");
        assert_eq!("00:1A:7D:DA:71:13".parse::<RawAddress>().unwrap(), address);
    }

    #[test]
    fn reject_malformed() {
        assert!("00:1a:7d:da:71".parse::<RawAddress>().is_err());
        assert!("00:1a:7d:da:71:13:00".parse::<RawAddress>().is_err());
        assert!("001a7dda7113".parse::<RawAddress>().is_err());
        assert!("zz:1a:7d:da:71:13".parse::<RawAddress>().is_err());
    }
}
