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

//! Strongly-typed identifiers for the objects handed to us by the GATT and
//! L2CAP layers.

use std::fmt;

/// A GATT client connection, 0 when not connected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnId(pub u16);

impl ConnId {
    /// Sentinel for "not GATT-connected".
    pub const NONE: Self = ConnId(0);

    /// True for any value other than [`ConnId::NONE`].
    pub fn is_connected(&self) -> bool {
        *self != Self::NONE
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// The handle of a given ATT attribute, 0 when unresolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttHandle(pub u16);

impl AttHandle {
    /// Sentinel for "not discovered yet".
    pub const UNRESOLVED: Self = AttHandle(0);

    /// True once discovery filled this handle in.
    pub fn is_resolved(&self) -> bool {
        *self != Self::UNRESOLVED
    }
}

impl fmt::Display for AttHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Identifies an open (or opening) LE credit-based channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GapHandle(pub u16);

impl GapHandle {
    /// Sentinel for "no channel".
    pub const INVALID: Self = GapHandle(0xffff);

    /// True for any value other than [`GapHandle::INVALID`].
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for GapHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for GapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The client registration returned by the GATT layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GattIf(pub u8);

impl fmt::Display for GattIf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
