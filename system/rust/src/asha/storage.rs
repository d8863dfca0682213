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

//! Pairing storage backed by a single JSON document.
//!
//! ```json
//! {
//!   "11:22:33:44:55:66": {
//!     "capabilities": 3,
//!     "hi_sync_id": 1234,
//!     "render_delay": 160,
//!     "preparation_delay": 0,
//!     "codecs": 6,
//!     "is_acceptlisted": true,
//!     "handles": { "audio_control_point": 21, ... }
//!   }
//! }
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::device::{Capabilities, GattHandles, HearingDevice, StoredProperties};
use super::ids::AttHandle;
use super::interfaces::{HearingAidStorage, StoredDevice};
use crate::core::address::RawAddress;

/// Entries stay untyped at the document level so one bad entry does not
/// hide the others.
type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredEntry {
    capabilities: u8,
    hi_sync_id: u64,
    render_delay: u16,
    preparation_delay: u16,
    codecs: u16,
    #[serde(default = "default_true")]
    is_acceptlisted: bool,
    #[serde(default)]
    handles: StoredHandles,
}

/// Handles absent from the entry stay unresolved, forcing discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StoredHandles {
    audio_control_point: u16,
    audio_status: u16,
    audio_status_ccc: u16,
    volume: u16,
    read_psm: u16,
    service_changed_ccc: u16,
}

fn default_true() -> bool {
    true
}

impl StoredEntry {
    fn new(device: &HearingDevice, is_acceptlisted: bool) -> Self {
        Self {
            capabilities: device.capabilities.bits(),
            hi_sync_id: device.hi_sync_id,
            render_delay: device.render_delay,
            preparation_delay: device.preparation_delay,
            codecs: device.codecs,
            is_acceptlisted,
            handles: device.handles.into(),
        }
    }

    fn properties(&self) -> StoredProperties {
        StoredProperties {
            capabilities: Capabilities::from_bits_retain(self.capabilities),
            hi_sync_id: self.hi_sync_id,
            render_delay: self.render_delay,
            preparation_delay: self.preparation_delay,
            codecs: self.codecs,
        }
    }
}

impl From<GattHandles> for StoredHandles {
    fn from(handles: GattHandles) -> Self {
        Self {
            audio_control_point: handles.audio_control_point.0,
            audio_status: handles.audio_status.0,
            audio_status_ccc: handles.audio_status_ccc.0,
            volume: handles.volume.0,
            read_psm: handles.read_psm.0,
            service_changed_ccc: handles.service_changed_ccc.0,
        }
    }
}

impl From<StoredHandles> for GattHandles {
    fn from(handles: StoredHandles) -> Self {
        Self {
            audio_control_point: AttHandle(handles.audio_control_point),
            audio_status: AttHandle(handles.audio_status),
            audio_status_ccc: AttHandle(handles.audio_status_ccc),
            volume: AttHandle(handles.volume),
            read_psm: AttHandle(handles.read_psm),
            service_changed_ccc: AttHandle(handles.service_changed_ccc),
        }
    }
}

fn parse_entry(entry: &Value) -> anyhow::Result<StoredEntry> {
    Ok(StoredEntry::deserialize(entry)?)
}

fn parse_device(address: &str, entry: &Value) -> anyhow::Result<StoredDevice> {
    let entry = parse_entry(entry)?;
    Ok(StoredDevice {
        address: address.parse()?,
        properties: entry.properties(),
        handles: entry.handles.into(),
        is_acceptlisted: entry.is_acceptlisted,
    })
}

pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stored hearing aid, for [`SessionController::add_from_storage`].
    /// Malformed entries are skipped.
    ///
    /// [`SessionController::add_from_storage`]: crate::asha::SessionController::add_from_storage
    pub fn load_devices(&self) -> anyhow::Result<Vec<StoredDevice>> {
        let document = self.read_document()?;
        Ok(document
            .iter()
            .filter_map(|(address, entry)| match parse_device(address, entry) {
                Ok(device) => Some(device),
                Err(e) => {
                    warn!("skipping stored hearing aid {address}: {e:#}");
                    None
                }
            })
            .collect())
    }

    /// Forgets a device. Returns false if it was not stored.
    pub fn remove(&self, address: &RawAddress) -> anyhow::Result<bool> {
        let mut document = self.read_document()?;
        if document.remove(&address.to_string()).is_none() {
            return Ok(false);
        }
        self.write_document(&document)?;
        info!("removed hearing aid {address}");
        Ok(true)
    }

    /// Controls whether the device is reconnected in the background on
    /// the next start.
    pub fn set_acceptlisted(
        &self,
        address: &RawAddress,
        acceptlisted: bool,
    ) -> anyhow::Result<()> {
        let mut document = self.read_document()?;
        let key = address.to_string();
        let mut entry = document
            .get(&key)
            .map(parse_entry)
            .transpose()
            .with_context(|| format!("bad entry for {address}"))?
            .ok_or_else(|| anyhow!("hearing aid {address} is not stored"))?;
        entry.is_acceptlisted = acceptlisted;
        document.insert(key, serde_json::to_value(entry)?);
        self.write_document(&document)
    }

    fn read_document(&self) -> anyhow::Result<Document> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", self.path.display()))
            }
        };
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("cannot parse {}", self.path.display()))?;
        match value {
            Value::Object(document) => Ok(document),
            _ => Err(anyhow!("{} is not a JSON object", self.path.display())),
        }
    }

    /// Replaces the file through a rename so a crash never leaves half a
    /// document behind.
    fn write_document(&self, document: &Document) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents).with_context(|| format!("cannot write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("cannot replace {}", self.path.display()))
    }
}

impl HearingAidStorage for JsonFileStorage {
    fn load(&self, address: RawAddress) -> anyhow::Result<Option<StoredProperties>> {
        let document = self.read_document()?;
        document
            .get(&address.to_string())
            .map(|entry| parse_entry(entry).map(|entry| entry.properties()))
            .transpose()
            .with_context(|| format!("bad entry for {address}"))
    }

    fn save(&self, device: &HearingDevice) -> anyhow::Result<()> {
        let mut document = self.read_document()?;
        let key = device.address.to_string();
        let acceptlisted = document
            .get(&key)
            .and_then(|entry| parse_entry(entry).ok())
            .map_or(true, |entry| entry.is_acceptlisted);

        document.insert(key, serde_json::to_value(StoredEntry::new(device, acceptlisted))?);
        self.write_document(&document)?;
        info!("stored hearing aid {}", device.address);
        Ok(())
    }
}
