//! Server configuration.
//!
//! Loaded from YAML, then overridden from the environment:
//!
//! ```yaml
//! bind: "0.0.0.0:8000"
//! data_dir: /var/lib/tilecast
//! devices_file: devices.yaml
//! idle_wait_secs: 60
//! render:
//!   command: pixlet
//!   apps_dir: /var/lib/tilecast/apps
//!   timeout_secs: 30
//! ```
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `TILECAST_BIND` | `bind` |
//! | `TILECAST_DATA_DIR` | `data_dir` |
//! | `TILECAST_API_TOKEN` | `api_token` |
//! | `TILECAST_RENDER_COMMAND` | `render.command` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::render::RenderConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the HTTP server
    pub bind: String,
    /// Root for cached images and queued pushes
    pub data_dir: PathBuf,
    /// Seed devices for the in-memory store
    pub devices_file: Option<PathBuf>,
    /// Image served when nothing else is displayable
    pub default_image: Option<PathBuf>,
    /// Longest a connected device waits before rotation is re-checked
    pub idle_wait_secs: u64,
    /// Server-wide token for push and dashboard endpoints
    pub api_token: Option<String>,
    pub render: RenderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            data_dir: PathBuf::from("data"),
            devices_file: None,
            default_image: None,
            idle_wait_secs: 60,
            api_token: None,
            render: RenderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::from_yaml(&content)?.with_env())
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("Invalid config YAML: {}", e)))
    }

    /// Apply `TILECAST_*` environment overrides.
    #[must_use]
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    #[must_use]
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("TILECAST_BIND") {
            self.bind = bind;
        }
        if let Some(dir) = lookup("TILECAST_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(token) = lookup("TILECAST_API_TOKEN") {
            self.api_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(command) = lookup("TILECAST_RENDER_COMMAND") {
            self.render.command = command;
        }
        self
    }

    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    #[must_use]
    pub fn with_apps_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.render.apps_dir = path.into();
        self
    }

    #[must_use]
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait_secs = wait.as_secs().max(1);
        self
    }

    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_secs.max(1))
    }
}
