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

//! Everything read from system properties and feature flags, resolved once
//! when the session is created.

use std::collections::HashMap;

use log::{error, info, warn};

use crate::core::address::RawAddress;

pub const INTERVAL_PROPERTY: &str = "persist.bluetooth.hearingaid.interval";
pub const MIN_CE_LEN_PROPERTY: &str = "persist.bluetooth.hearing_aid_min_ce_len";
pub const MAX_CE_LEN_PROPERTY: &str = "persist.bluetooth.hearing_aid_max_ce_len";
/// `<address>=<min>/<max>` entries separated by commas.
pub const DEVICE_CE_LEN_PROPERTY: &str = "persist.bluetooth.hearing_aid_device_ce_len";
pub const ASRC_FLAG: &str = "bluetooth.flags.asha_asrc";
pub const HIGHER_FLUSH_THRESHOLD_FLAG: &str = "bluetooth.flags.higher_l2cap_flush_threshold";
pub const ENCRYPTED_L2C_COC_FLAG: &str = "bluetooth.flags.asha_encrypted_l2c_coc";

pub const INTERVAL_10_MS: u16 = 10;
pub const INTERVAL_20_MS: u16 = 20;

/// Read access to the platform's key/value property store.
pub trait SystemProperties {
    fn get(&self, key: &str) -> Option<String>;

    fn get_i32(&self, key: &str, default: i32) -> i32 {
        match self.get(key) {
            Some(value) => value.trim().parse().unwrap_or_else(|_| {
                warn!("{key}: cannot parse {value:?} as an integer");
                default
            }),
            None => default,
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref().map(str::trim) {
            Some("1" | "true" | "y" | "yes" | "on") => true,
            Some("0" | "false" | "n" | "no" | "off") => false,
            _ => default,
        }
    }
}

impl SystemProperties for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Operator override of the connection event length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CeLenOverride {
    pub min: Option<u16>,
    pub max: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AshaConfig {
    /// Audio interval in ms, always 10 or 20.
    pub data_interval_ms: u16,
    pub ce_len_override: CeLenOverride,
    pub device_ce_len_overrides: HashMap<RawAddress, CeLenOverride>,
    pub asrc_enabled: bool,
    pub higher_l2cap_flush_threshold: bool,
    pub encrypted_l2c_coc: bool,
}

impl Default for AshaConfig {
    fn default() -> Self {
        Self {
            data_interval_ms: INTERVAL_20_MS,
            ce_len_override: CeLenOverride::default(),
            device_ce_len_overrides: HashMap::new(),
            asrc_enabled: false,
            higher_l2cap_flush_threshold: false,
            encrypted_l2c_coc: false,
        }
    }
}

impl AshaConfig {
    pub fn from_properties(props: &dyn SystemProperties) -> Self {
        let mut data_interval_ms = props.get_i32(INTERVAL_PROPERTY, INTERVAL_20_MS.into());
        if data_interval_ms != i32::from(INTERVAL_10_MS)
            && data_interval_ms != i32::from(INTERVAL_20_MS)
        {
            error!("invalid interval={data_interval_ms}ms. Overwriting back to default");
            data_interval_ms = INTERVAL_20_MS.into();
        }

        let ce_len_override = CeLenOverride {
            min: ce_len_from(props.get_i32(MIN_CE_LEN_PROPERTY, -1)),
            max: ce_len_from(props.get_i32(MAX_CE_LEN_PROPERTY, -1)),
        };
        let device_ce_len_overrides =
            props.get(DEVICE_CE_LEN_PROPERTY).map(|v| parse_device_overrides(&v)).unwrap_or_default();

        let config = Self {
            data_interval_ms: data_interval_ms as u16,
            ce_len_override,
            device_ce_len_overrides,
            asrc_enabled: props.get_bool(ASRC_FLAG, false),
            higher_l2cap_flush_threshold: props.get_bool(HIGHER_FLUSH_THRESHOLD_FLAG, false),
            encrypted_l2c_coc: props.get_bool(ENCRYPTED_L2C_COC_FLAG, false),
        };
        info!(
            "default_data_interval_ms={} overwrite_min_ce_len={:?} overwrite_max_ce_len={:?}",
            config.data_interval_ms, config.ce_len_override.min, config.ce_len_override.max
        );
        config
    }

    /// Queued packet count above which a side is considered backlogged.
    pub fn l2cap_flush_threshold(&self) -> usize {
        // Skipping packets breaks the resampler's clock model, so only a
        // full credit window counts as a backlog when it is running.
        if self.asrc_enabled {
            8
        } else if self.higher_l2cap_flush_threshold {
            1
        } else {
            0
        }
    }

    /// The override applying to `address`. A per-device entry wins over the
    /// global properties, field by field.
    pub fn ce_len_override_for(&self, address: &RawAddress) -> CeLenOverride {
        let device = self.device_ce_len_overrides.get(address).copied().unwrap_or_default();
        CeLenOverride {
            min: device.min.or(self.ce_len_override.min),
            max: device.max.or(self.ce_len_override.max),
        }
    }
}

fn ce_len_from(value: i32) -> Option<u16> {
    u16::try_from(value).ok()
}

fn parse_device_overrides(value: &str) -> HashMap<RawAddress, CeLenOverride> {
    let mut overrides = HashMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = entry.split_once('=').and_then(|(address, lens)| {
            let address = address.trim().parse::<RawAddress>().ok()?;
            let (min, max) = lens.split_once('/')?;
            let min = ce_len_from(min.trim().parse().ok()?);
            let max = ce_len_from(max.trim().parse().ok()?);
            Some((address, CeLenOverride { min, max }))
        });
        match parsed {
            Some((address, ce_len)) => {
                overrides.insert(address, ce_len);
            }
            None => warn!("{DEVICE_CE_LEN_PROPERTY}: ignoring malformed entry {entry:?}"),
        }
    }
    overrides
}
