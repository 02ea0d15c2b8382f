//! Persistence boundary.
//!
//! The server never overwrites whole records. Every write names the one
//! field (or field group) it changes, so a session updating `last_seen`
//! cannot clobber a settings change made concurrently elsewhere.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::{Device, Transport};

/// A single field-scoped change to a device record.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceUpdate {
    PinnedApp(Option<String>),
    LastAppIndex(usize),
    Displaying(Option<String>),
    LastSeen(DateTime<Utc>),
    Transport(Transport),
    /// Only the `Some` fields are written
    Firmware {
        firmware_version: Option<String>,
        firmware_type: Option<String>,
        protocol_version: Option<u32>,
        mac: Option<String>,
    },
}

/// Result of one render attempt, written back to the installation.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutcome {
    pub rendered_at: DateTime<Utc>,
    pub duration: Duration,
    pub success: bool,
    pub messages: Vec<String>,
}

/// Storage for devices and their installations.
///
/// Update methods return the number of affected records. Zero means the
/// target no longer exists, which callers treat as a lost race rather than
/// an error.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Load a device with its installations.
    async fn device(&self, id: &str) -> Result<Option<Device>>;

    async fn update_device(&self, id: &str, update: DeviceUpdate) -> Result<u64>;

    /// Write render bookkeeping, only if the installation still exists.
    async fn record_render(
        &self,
        device_id: &str,
        iname: &str,
        outcome: &RenderOutcome,
    ) -> Result<u64>;
}

/// In-process store, seedable from YAML.
///
/// ```yaml
/// devices:
///   - id: tile-1
///     owner: alice
///     installations:
///       - iname: "100"
///         name: clock
///         app_path: clock/clock.star
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, Device>>,
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    devices: Vec<Device>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: RwLock::new(devices.into_iter().map(|d| (d.id.clone(), d)).collect()),
        }
    }

    /// Load seed devices from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read devices file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let seed: SeedFile = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Invalid devices YAML: {}", e)))?;
        Ok(Self::from_devices(seed.devices))
    }

    pub async fn insert(&self, device: Device) {
        self.devices.write().await.insert(device.id.clone(), device);
    }

    pub async fn remove_installation(&self, device_id: &str, iname: &str) -> u64 {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(device_id) else {
            return 0;
        };
        let before = device.installations.len();
        device.installations.retain(|i| i.iname != iname);
        (before - device.installations.len()) as u64
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn device(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(id).cloned())
    }

    async fn update_device(&self, id: &str, update: DeviceUpdate) -> Result<u64> {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(id) else {
            return Ok(0);
        };

        match update {
            DeviceUpdate::PinnedApp(pinned) => device.pinned_app = pinned,
            DeviceUpdate::LastAppIndex(index) => device.last_app_index = index,
            DeviceUpdate::Displaying(iname) => device.displaying = iname,
            DeviceUpdate::LastSeen(at) => device.last_seen = Some(at),
            DeviceUpdate::Transport(transport) => device.protocol.transport = Some(transport),
            DeviceUpdate::Firmware {
                firmware_version,
                firmware_type,
                protocol_version,
                mac,
            } => {
                let protocol = &mut device.protocol;
                if firmware_version.is_some() {
                    protocol.firmware_version = firmware_version;
                }
                if firmware_type.is_some() {
                    protocol.firmware_type = firmware_type;
                }
                if protocol_version.is_some() {
                    protocol.protocol_version = protocol_version;
                }
                if mac.is_some() {
                    protocol.mac = mac;
                }
            }
        }
        Ok(1)
    }

    async fn record_render(
        &self,
        device_id: &str,
        iname: &str,
        outcome: &RenderOutcome,
    ) -> Result<u64> {
        let mut devices = self.devices.write().await;
        let Some(installation) = devices
            .get_mut(device_id)
            .and_then(|d| d.installations.iter_mut().find(|i| i.iname == iname))
        else {
            return Ok(0);
        };

        installation.last_render = Some(outcome.rendered_at);
        installation.last_render_duration_ms = outcome.duration.as_millis() as u64;
        installation.empty_last_render = !outcome.success;
        installation.render_messages = outcome.messages.clone();
        if outcome.success {
            installation.last_successful_render = Some(outcome.rendered_at);
        }
        Ok(1)
    }
}
