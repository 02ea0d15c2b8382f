//! Devices, installations and display-mode resolution.
//!
//! These records mirror what the persistence layer stores. Anything derived
//! (rotation sequences, effective brightness) is computed on demand and never
//! written back.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::schedule::{local_time, resolve_timezone, time_of_day, TimeWindow, VisibilitySchedule};

/// Dwell time used when neither the device nor the installation sets one.
pub const DEFAULT_DWELL_SECS: u32 = 15;

/// How a device last talked to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Stateless polling (`GET .../next`)
    Http,
    /// Persistent acknowledgment-driven connection
    WebSocket,
}

/// Color filter applied by the renderer.
///
/// `Inherit` only makes sense on an installation and defers to the device.
/// `None` explicitly disables filtering, even if a mode would set one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFilter {
    #[default]
    Inherit,
    None,
    Dimmed,
    Redshift,
    Warm,
    Sunset,
    Sepia,
    Vintage,
    Cool,
    Moonlight,
    Grayscale,
}

impl ColorFilter {
    /// Name handed to the renderer.
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorFilter::Inherit => "inherit",
            ColorFilter::None => "none",
            ColorFilter::Dimmed => "dimmed",
            ColorFilter::Redshift => "redshift",
            ColorFilter::Warm => "warm",
            ColorFilter::Sunset => "sunset",
            ColorFilter::Sepia => "sepia",
            ColorFilter::Vintage => "vintage",
            ColorFilter::Cool => "cool",
            ColorFilter::Moonlight => "moonlight",
            ColorFilter::Grayscale => "grayscale",
        }
    }
}

/// Night mode settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightMode {
    #[serde(default)]
    pub enabled: bool,
    /// Start time (HH:MM, 24-hour format)
    #[serde(default = "default_night_start")]
    pub start: String,
    /// End time (HH:MM, 24-hour format), exclusive
    #[serde(default = "default_night_end")]
    pub end: String,
    /// Brightness percentage while active
    #[serde(default = "default_night_brightness")]
    pub brightness: u8,
    #[serde(default)]
    pub color_filter: Option<ColorFilter>,
    /// Installation shown regardless of its enabled flag while active
    #[serde(default)]
    pub app: Option<String>,
}

fn default_night_start() -> String {
    "22:00".to_string()
}

fn default_night_end() -> String {
    "06:00".to_string()
}

fn default_night_brightness() -> u8 {
    5
}

impl Default for NightMode {
    fn default() -> Self {
        Self {
            enabled: false,
            start: default_night_start(),
            end: default_night_end(),
            brightness: default_night_brightness(),
            color_filter: None,
            app: None,
        }
    }
}

/// Dim mode settings.
///
/// Dim mode has its own start time. Its end defaults to the night-mode end,
/// or midnight if that is unset too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimMode {
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    pub brightness: u8,
    #[serde(default)]
    pub color_filter: Option<ColorFilter>,
}

/// Firmware-reported protocol details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    /// Set once the firmware has ever reported one
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub firmware_type: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub transport: Option<Transport>,
}

/// An app instance bound to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    /// Unique within the device
    pub iname: String,
    /// App name, used for cache keys and logs
    pub name: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum seconds between re-renders
    #[serde(default)]
    pub render_interval_secs: u64,
    /// 0 = use the device default
    #[serde(default)]
    pub dwell_secs: u32,
    #[serde(default)]
    pub last_render: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_successful_render: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_render_duration_ms: u64,
    /// True when the last render failed or produced nothing
    #[serde(default)]
    pub empty_last_render: bool,
    #[serde(default)]
    pub render_messages: Vec<String>,
    #[serde(default)]
    pub autopin: bool,
    /// Image supplied externally, never rendered locally
    #[serde(default)]
    pub pushed: bool,
    /// App source, relative to the configured apps directory
    #[serde(default)]
    pub app_path: Option<PathBuf>,
    /// Pre-rendered image file shown as-is
    #[serde(default)]
    pub static_image: Option<PathBuf>,
    #[serde(default)]
    pub color_filter: ColorFilter,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub schedule: Option<VisibilitySchedule>,
}

fn default_true() -> bool {
    true
}

impl Installation {
    /// Create an enabled installation with defaults for everything else.
    pub fn new(iname: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            iname: iname.into(),
            name: name.into(),
            order: 0,
            enabled: true,
            render_interval_secs: 0,
            dwell_secs: 0,
            last_render: None,
            last_successful_render: None,
            last_render_duration_ms: 0,
            empty_last_render: false,
            render_messages: Vec::new(),
            autopin: false,
            pushed: false,
            app_path: None,
            static_image: None,
            color_filter: ColorFilter::Inherit,
            config: serde_json::Map::new(),
            schedule: None,
        }
    }

    /// Set display order.
    #[must_use]
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Set enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set app source path.
    #[must_use]
    pub fn with_app_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.app_path = Some(path.into());
        self
    }

    /// Mark as externally pushed.
    #[must_use]
    pub fn pushed(mut self) -> Self {
        self.pushed = true;
        self
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_secs(self.render_interval_secs)
    }

    /// Whether enough time has passed since the last render attempt.
    pub fn render_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_render {
            None => true,
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed >= self.render_interval(),
                // Clock went backwards; render rather than get stuck
                Err(_) => true,
            },
        }
    }

    /// Whether this installation's own schedule allows it at `local`.
    pub fn schedule_active<T: chrono::TimeZone>(&self, local: &DateTime<T>) -> bool {
        self.schedule
            .as_ref()
            .map_or(true, |schedule| schedule.is_active_at(local))
    }
}

/// A display tile and its rotation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// User whose dashboard observes this device
    #[serde(default)]
    pub owner: Option<String>,
    /// Key required by the push endpoint, if set
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub installations: Vec<Installation>,
    #[serde(default)]
    pub pinned_app: Option<String>,
    #[serde(default)]
    pub interstitial_app: Option<String>,
    #[serde(default)]
    pub interstitial_enabled: bool,
    #[serde(default)]
    pub night_mode: NightMode,
    #[serde(default)]
    pub dim_mode: Option<DimMode>,
    /// Brightness percentage (0-100)
    #[serde(default = "default_brightness")]
    pub brightness: u8,
    #[serde(default)]
    pub color_filter: Option<ColorFilter>,
    #[serde(default = "default_dwell")]
    pub default_dwell_secs: u32,
    /// Cursor into the last computed rotation sequence
    #[serde(default)]
    pub last_app_index: usize,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub supports_2x: bool,
    #[serde(default)]
    pub protocol: ProtocolInfo,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Installation the device last acknowledged as on screen
    #[serde(default)]
    pub displaying: Option<String>,
}

fn default_brightness() -> u8 {
    100
}

fn default_dwell() -> u32 {
    DEFAULT_DWELL_SECS
}

impl Device {
    /// Create a device with default settings and no installations.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            owner: None,
            api_key: None,
            installations: Vec::new(),
            pinned_app: None,
            interstitial_app: None,
            interstitial_enabled: false,
            night_mode: NightMode::default(),
            dim_mode: None,
            brightness: default_brightness(),
            color_filter: None,
            default_dwell_secs: DEFAULT_DWELL_SECS,
            last_app_index: 0,
            timezone: None,
            locale: None,
            supports_2x: false,
            protocol: ProtocolInfo::default(),
            last_seen: None,
            displaying: None,
        }
    }

    /// Add an installation.
    #[must_use]
    pub fn with_installation(mut self, installation: Installation) -> Self {
        self.installations.push(installation);
        self
    }

    pub fn installation(&self, iname: &str) -> Option<&Installation> {
        self.installations.iter().find(|i| i.iname == iname)
    }

    pub fn tz(&self) -> Tz {
        resolve_timezone(self.timezone.as_deref())
    }

    pub fn local_now(&self, now: DateTime<Utc>) -> DateTime<Tz> {
        local_time(now, self.tz())
    }

    /// Whether the firmware has ever reported a protocol version.
    pub fn has_protocol_version(&self) -> bool {
        self.protocol.protocol_version.is_some()
    }

    pub fn night_mode_active(&self, now: DateTime<Utc>) -> bool {
        if !self.night_mode.enabled {
            return false;
        }
        match TimeWindow::parse(&self.night_mode.start, &self.night_mode.end) {
            Some(window) => window.contains(time_of_day(&self.local_now(now))),
            None => false,
        }
    }

    pub fn dim_mode_active(&self, now: DateTime<Utc>) -> bool {
        let Some(dim) = &self.dim_mode else {
            return false;
        };
        let end = match &dim.end {
            Some(end) => end.as_str(),
            None if self.night_mode.enabled => self.night_mode.end.as_str(),
            None => "00:00",
        };
        match TimeWindow::parse(&dim.start, end) {
            Some(window) => window.contains(time_of_day(&self.local_now(now))),
            None => false,
        }
    }

    /// The night-mode app, only while night mode is active.
    pub fn active_night_app(&self, now: DateTime<Utc>) -> Option<&str> {
        if self.night_mode_active(now) {
            self.night_mode.app.as_deref()
        } else {
            None
        }
    }

    /// Brightness percentage in effect at `now`.
    pub fn effective_brightness(&self, now: DateTime<Utc>) -> u8 {
        let percent = match &self.dim_mode {
            Some(dim) if self.dim_mode_active(now) => dim.brightness,
            _ if self.night_mode_active(now) => self.night_mode.brightness,
            _ => self.brightness,
        };
        percent.min(100)
    }

    /// Color filter the renderer should apply, `None` for no filtering.
    pub fn effective_filter(
        &self,
        installation: Option<&Installation>,
        now: DateTime<Utc>,
    ) -> Option<ColorFilter> {
        let explicit = installation
            .map(|i| i.color_filter)
            .filter(|f| *f != ColorFilter::Inherit);

        let mode = if self.dim_mode_active(now) {
            self.dim_mode.as_ref().and_then(|d| d.color_filter)
        } else {
            None
        }
        .or_else(|| {
            if self.night_mode_active(now) {
                self.night_mode.color_filter
            } else {
                None
            }
        });

        explicit
            .or(mode)
            .or(self.color_filter)
            .filter(|f| !matches!(f, ColorFilter::None | ColorFilter::Inherit))
    }

    /// Dwell time for an installation, falling back to the device default.
    pub fn dwell_secs_for(&self, installation: Option<&Installation>) -> u32 {
        match installation {
            Some(i) if i.dwell_secs > 0 => i.dwell_secs,
            _ => self.default_dwell_secs.max(1),
        }
    }
}
