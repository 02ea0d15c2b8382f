//! Device wire protocol.
//!
//! Each cycle the server sends small JSON metadata frames followed by one
//! binary frame holding the image:
//!
//! ```text
//! -> {"dwell_secs": 15}
//! -> {"brightness": 128}        only when changed
//! -> <binary webp>
//! -> {"immediate": true}        only right after a push interrupt
//! <- {"queued": 3}
//! <- {"displaying": 3}          or {"counter": 3}
//! ```
//!
//! Firmware may attach a `client_info` block to any inbound message.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::DeviceUpdate;

/// Floor for the ack wait on firmware that reports a protocol version.
pub const MIN_VERSIONED_ACK_TIMEOUT: Duration = Duration::from_secs(25);

/// Top of the firmware brightness scale.
pub const MAX_WIRE_BRIGHTNESS: u8 = 255;

/// A frame on a device connection, independent of the transport library.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Server-to-device metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Dwell(u32),
    Brightness(u8),
    Immediate,
    /// Opaque command envelope (reboot, firmware settings, ...)
    Command(serde_json::Value),
}

#[derive(Serialize)]
struct DwellFrame {
    dwell_secs: u32,
}

#[derive(Serialize)]
struct BrightnessFrame {
    brightness: u8,
}

#[derive(Serialize)]
struct ImmediateFrame {
    immediate: bool,
}

impl Outbound {
    pub fn to_json(&self) -> Result<String> {
        let json = match self {
            Outbound::Dwell(dwell_secs) => serde_json::to_string(&DwellFrame {
                dwell_secs: *dwell_secs,
            })?,
            Outbound::Brightness(brightness) => serde_json::to_string(&BrightnessFrame {
                brightness: *brightness,
            })?,
            Outbound::Immediate => serde_json::to_string(&ImmediateFrame { immediate: true })?,
            Outbound::Command(value) => serde_json::to_string(value)?,
        };
        Ok(json)
    }

    pub fn to_message(&self) -> Result<WireMessage> {
        Ok(WireMessage::Text(self.to_json()?))
    }
}

/// Device-to-server acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub queued: Option<i64>,
    #[serde(default)]
    pub displaying: Option<i64>,
    #[serde(default)]
    pub counter: Option<i64>,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

impl Ack {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Whether the device says the last frame is now on screen.
    pub fn confirms_display(&self) -> bool {
        self.displaying.is_some() || self.counter.is_some()
    }
}

/// Firmware self-description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub firmware_type: Option<String>,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub mac: Option<String>,
}

impl ClientInfo {
    pub fn into_update(self) -> DeviceUpdate {
        DeviceUpdate::Firmware {
            firmware_version: self.firmware_version,
            firmware_type: self.firmware_type,
            protocol_version: self.protocol_version,
            mac: self.mac,
        }
    }
}

/// How long to wait for an ack after sending a frame.
///
/// Firmware that speaks a versioned protocol buffers frames, so it gets
/// `max(2 * dwell, 25s)`. Older firmware never acks and is paced at
/// exactly the dwell time.
pub fn ack_timeout(dwell_secs: u32, versioned: bool) -> Duration {
    let dwell = Duration::from_secs(u64::from(dwell_secs));
    if versioned {
        (dwell * 2).max(MIN_VERSIONED_ACK_TIMEOUT)
    } else {
        dwell
    }
}

/// Convert a brightness percentage to the firmware's 0-255 scale.
pub fn brightness_to_wire(percent: u8) -> u8 {
    let percent = u32::from(percent.min(100));
    ((percent * u32::from(MAX_WIRE_BRIGHTNESS) + 50) / 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_frames() {
        assert_eq!(Outbound::Dwell(15).to_json().unwrap(), r#"{"dwell_secs":15}"#);
        assert_eq!(Outbound::Brightness(128).to_json().unwrap(), r#"{"brightness":128}"#);
        assert_eq!(Outbound::Immediate.to_json().unwrap(), r#"{"immediate":true}"#);
        assert_eq!(
            Outbound::Command(serde_json::json!({"reboot": true}))
                .to_json()
                .unwrap(),
            r#"{"reboot":true}"#
        );
    }

    #[test]
    fn test_ack_parsing() {
        let ack = Ack::parse(r#"{"queued": 4}"#).unwrap();
        assert_eq!(ack.queued, Some(4));
        assert!(!ack.confirms_display());

        assert!(Ack::parse(r#"{"displaying": 4}"#).unwrap().confirms_display());
        assert!(Ack::parse(r#"{"counter": 9}"#).unwrap().confirms_display());
        assert!(Ack::parse("not json").is_err());
    }

    #[test]
    fn test_client_info() {
        let ack = Ack::parse(
            r#"{"client_info": {"firmware_version": "1.2.0", "firmware_type": "matrix",
                "protocol_version": 1, "mac": "aa:bb:cc:dd:ee:ff"}}"#,
        )
        .unwrap();
        let info = ack.client_info.unwrap();
        assert_eq!(info.protocol_version, Some(1));

        match info.into_update() {
            DeviceUpdate::Firmware {
                firmware_version,
                mac,
                ..
            } => {
                assert_eq!(firmware_version.as_deref(), Some("1.2.0"));
                assert_eq!(mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
            }
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[test]
    fn test_ack_timeout() {
        assert_eq!(ack_timeout(10, true), Duration::from_secs(25));
        assert_eq!(ack_timeout(20, true), Duration::from_secs(40));
        assert_eq!(ack_timeout(10, false), Duration::from_secs(10));
        assert_eq!(ack_timeout(30, false), Duration::from_secs(30));
    }

    #[test]
    fn test_brightness_to_wire() {
        assert_eq!(brightness_to_wire(0), 0);
        assert_eq!(brightness_to_wire(100), 255);
        assert_eq!(brightness_to_wire(50), 128);
        assert_eq!(brightness_to_wire(200), 255);
    }
}
