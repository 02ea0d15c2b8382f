//! Rendering apps into display images.
//!
//! The renderer itself is an external collaborator behind the [`Renderer`]
//! trait. [`CommandRenderer`] runs an app-rendering CLI (pixlet-compatible
//! by default) as a subprocess. [`RenderOrchestrator`] decides when a render
//! is needed and keeps installation bookkeeping and the image cache in sync.
//!
//! # Example
//!
//! ```rust,ignore
//! use tilecast::render::{CommandRenderer, RenderConfig};
//!
//! let config = RenderConfig::default().with_command("/usr/local/bin/pixlet");
//! let renderer = CommandRenderer::new(config);
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::cache::{ImageKey, ImageStore};
use crate::error::{Error, Result};
use crate::model::{ColorFilter, Device, Installation};
use crate::notify::{user_key, Notification, Notifier};
use crate::store::{DeviceStore, DeviceUpdate, RenderOutcome};
use crate::{DISPLAY_HEIGHT, DISPLAY_WIDTH};

/// Config key under which the device timezone is handed to apps.
pub const TIMEZONE_CONFIG_KEY: &str = "$tz";

/// Everything the renderer needs for one app render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub app_path: PathBuf,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub width: u32,
    pub height: u32,
    pub dwell_secs: u32,
    pub timeout: Duration,
    pub enable_cache: bool,
    pub supports_2x: bool,
    pub timezone: String,
    pub locale: Option<String>,
    pub filter: Option<ColorFilter>,
}

/// Renderer result. An empty `image` means "nothing to display".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderOutput {
    pub image: Vec<u8>,
    pub messages: Vec<String>,
}

/// External app renderer.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<RenderOutput>;
}

/// Configuration for app rendering.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Renderer executable (default: "pixlet", or `TILECAST_RENDER_COMMAND`)
    pub command: String,

    /// Directory app paths are resolved against
    pub apps_dir: PathBuf,

    /// Directory for renderer output files
    pub temp_dir: PathBuf,

    /// Render budget in seconds, enforced by the caller
    pub timeout_secs: u64,

    /// Let the renderer reuse cached HTTP/app state
    pub enable_cache: bool,

    pub width: u32,
    pub height: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            command: std::env::var("TILECAST_RENDER_COMMAND")
                .unwrap_or_else(|_| "pixlet".to_string()),
            apps_dir: PathBuf::from("apps"),
            temp_dir: std::env::temp_dir().join("tilecast-render"),
            timeout_secs: 30,
            enable_cache: true,
            width: DISPLAY_WIDTH,
            height: DISPLAY_HEIGHT,
        }
    }
}

impl RenderConfig {
    /// Use a custom renderer executable.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Resolve app paths against a different directory.
    #[must_use]
    pub fn with_apps_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.apps_dir = path.into();
        self
    }

    /// Set the render budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Renders apps by running an external CLI.
///
/// Invocation shape:
///
/// ```text
/// <command> render <app> key=value... --output <file> --width 64 --height 32
///     --timeout <secs> [--2x] [--no-cache] [--locale <l>] [--filter <f>]
/// ```
///
/// The process is killed if it outlives the request timeout.
#[derive(Debug)]
pub struct CommandRenderer {
    config: RenderConfig,
    counter: AtomicU64,
}

impl CommandRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }

    fn args(&self, request: &RenderRequest, output: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            "render".to_string(),
            request.app_path.display().to_string(),
        ];
        for (key, value) in &request.config {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            args.push(format!("{}={}", key, value));
        }
        args.extend([
            "--output".to_string(),
            output.display().to_string(),
            "--width".to_string(),
            request.width.to_string(),
            "--height".to_string(),
            request.height.to_string(),
            "--timeout".to_string(),
            request.timeout.as_secs().to_string(),
        ]);
        if request.supports_2x {
            args.push("--2x".to_string());
        }
        if !request.enable_cache {
            args.push("--no-cache".to_string());
        }
        if let Some(locale) = &request.locale {
            args.push("--locale".to_string());
            args.push(locale.clone());
        }
        if let Some(filter) = request.filter {
            args.push("--filter".to_string());
            args.push(filter.as_str().to_string());
        }
        args
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderOutput> {
        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|e| Error::Io(format!("Failed to create temp dir: {}", e)))?;

        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let output_path = self
            .config
            .temp_dir
            .join(format!("render-{}-{}.webp", std::process::id(), seq));

        let run = Command::new(&self.config.command)
            .args(self.args(request, &output_path))
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(request.timeout, run)
            .await
            .map_err(|_| Error::RenderTimeout(request.timeout))?
            .map_err(|e| Error::Render(format!("Failed to run {}: {}", self.config.command, e)))?;

        let messages: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(Error::Render(format!(
                "{} exited with {}: {}",
                self.config.command,
                output.status,
                messages.last().map(String::as_str).unwrap_or("no output")
            )));
        }

        // A missing output file is the renderer saying "nothing to show"
        let image = match tokio::fs::read(&output_path).await {
            Ok(image) => image,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::Io(format!("Failed to read render output: {}", e))),
        };
        let _ = tokio::fs::remove_file(&output_path).await;

        Ok(RenderOutput { image, messages })
    }
}

/// Keeps installation images fresh.
#[derive(Clone)]
pub struct RenderOrchestrator {
    store: Arc<dyn DeviceStore>,
    images: Arc<ImageStore>,
    renderer: Arc<dyn Renderer>,
    notifier: Notifier,
    config: RenderConfig,
}

impl std::fmt::Debug for RenderOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RenderOrchestrator {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        images: Arc<ImageStore>,
        renderer: Arc<dyn Renderer>,
        notifier: Notifier,
        config: RenderConfig,
    ) -> Self {
        Self {
            store,
            images,
            renderer,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &dyn DeviceStore {
        self.store.as_ref()
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    /// Make sure `installation` has a current image in the cache.
    ///
    /// Returns `false` if there is nothing displayable. Failures are logged
    /// and never propagated; a bad app must not take down rotation.
    pub async fn ensure_fresh(
        &self,
        device: &Device,
        installation: &Installation,
        now: DateTime<Utc>,
    ) -> bool {
        if installation.pushed {
            return true;
        }

        let key = ImageKey::installation(&device.id, &installation.name, &installation.iname);

        if let Some(source) = &installation.static_image {
            if self.images.exists(&key).await {
                return true;
            }
            let source = self.config.apps_dir.join(source);
            return match self.images.import(&key, &source).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        "Static image for {}/{} unavailable: {}",
                        device.id,
                        installation.iname,
                        e
                    );
                    false
                }
            };
        }

        if !installation.render_due(now) {
            return !installation.empty_last_render;
        }

        let Some(app_path) = &installation.app_path else {
            tracing::warn!(
                "Installation {}/{} has no app to render",
                device.id,
                installation.iname
            );
            return false;
        };

        let request = self.request(device, installation, self.config.apps_dir.join(app_path), now);
        let started = Instant::now();
        // The renderer is not trusted to honor its own timeout
        let result = match tokio::time::timeout(request.timeout, self.renderer.render(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::RenderTimeout(request.timeout)),
        };
        let duration = started.elapsed();

        let (image, messages) = match result {
            Ok(output) if output.image.is_empty() => {
                tracing::debug!("{}/{} rendered nothing", device.id, installation.iname);
                (None, output.messages)
            }
            Ok(output) => (Some(output.image), output.messages),
            Err(e) => {
                tracing::warn!("Render of {}/{} failed: {}", device.id, installation.iname, e);
                (None, vec![e.to_string()])
            }
        };

        let outcome = RenderOutcome {
            rendered_at: now,
            duration,
            success: image.is_some(),
            messages,
        };
        match self
            .store
            .record_render(&device.id, &installation.iname, &outcome)
            .await
        {
            Ok(0) => {
                tracing::info!(
                    "Installation {}/{} was deleted during render, discarding",
                    device.id,
                    installation.iname
                );
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Failed to record render for {}: {}", installation.iname, e);
                return false;
            }
        }

        let Some(image) = image else {
            return false;
        };
        if let Err(e) = self.images.put(&key, &image).await {
            tracing::warn!("Failed to cache image for {}: {}", installation.iname, e);
            return false;
        }
        tracing::info!(
            "Rendered {}/{} ({} bytes in {:?})",
            device.id,
            installation.iname,
            image.len(),
            duration
        );

        if installation.autopin {
            self.autopin(device, installation).await;
        }
        true
    }

    /// Cached image for an installation, if any.
    pub async fn load(&self, device: &Device, installation: &Installation) -> Option<Bytes> {
        let key = ImageKey::installation(&device.id, &installation.name, &installation.iname);
        match self.images.get(&key).await {
            Ok(image) => image.filter(|i| !i.is_empty()),
            Err(e) => {
                tracing::warn!("Failed to read cached image for {}: {}", installation.iname, e);
                None
            }
        }
    }

    fn request(
        &self,
        device: &Device,
        installation: &Installation,
        app_path: PathBuf,
        now: DateTime<Utc>,
    ) -> RenderRequest {
        let timezone = device.tz().name().to_string();
        let mut config = installation.config.clone();
        config.insert(
            TIMEZONE_CONFIG_KEY.to_string(),
            serde_json::Value::String(timezone.clone()),
        );

        RenderRequest {
            app_path,
            config,
            width: self.config.width,
            height: self.config.height,
            dwell_secs: device.dwell_secs_for(Some(installation)),
            timeout: self.config.timeout(),
            enable_cache: self.config.enable_cache,
            supports_2x: device.supports_2x,
            timezone,
            locale: device.locale.clone(),
            filter: device.effective_filter(Some(installation), now),
        }
    }

    async fn autopin(&self, device: &Device, installation: &Installation) {
        if device.pinned_app.as_deref() == Some(installation.iname.as_str()) {
            return;
        }
        match self
            .store
            .update_device(
                &device.id,
                DeviceUpdate::PinnedApp(Some(installation.iname.clone())),
            )
            .await
        {
            Ok(_) => {
                tracing::info!("Auto-pinned {} on {}", installation.iname, device.id);
                if let Some(owner) = &device.owner {
                    self.notifier.notify(&user_key(owner), Notification::Refresh);
                }
            }
            Err(e) => tracing::warn!("Failed to auto-pin {}: {}", installation.iname, e),
        }
    }
}
