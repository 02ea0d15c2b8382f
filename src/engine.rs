//! Shared server context.
//!
//! [`Engine`] owns the pieces every request and session needs: the device
//! store, the image cache, the notifier and the render orchestrator. It is
//! built once and shared behind an `Arc`.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::cache::ImageStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Device;
use crate::notify::{user_key, Notification, Notifier};
use crate::render::{RenderOrchestrator, Renderer};
use crate::rotation::determine_next;
use crate::store::{DeviceStore, DeviceUpdate};
use crate::DEFAULT_IMAGE;

/// One image ready to go out, with how long it should stay up.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image: Bytes,
    pub dwell_secs: u32,
    /// Installation the image came from; `None` for ad-hoc pushes
    pub installation: Option<String>,
}

pub struct Engine {
    config: Config,
    store: Arc<dyn DeviceStore>,
    images: Arc<ImageStore>,
    notifier: Notifier,
    orchestrator: RenderOrchestrator,
    default_image: Bytes,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("images", &self.images)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: Config, store: Arc<dyn DeviceStore>, renderer: Arc<dyn Renderer>) -> Self {
        let images = Arc::new(ImageStore::new(config.image_dir()));
        let notifier = Notifier::new();
        let orchestrator = RenderOrchestrator::new(
            store.clone(),
            images.clone(),
            renderer,
            notifier.clone(),
            config.render.clone(),
        );
        Self {
            config,
            store,
            images,
            notifier,
            orchestrator,
            default_image: Bytes::from_static(DEFAULT_IMAGE),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the built-in fallback image.
    #[must_use]
    pub fn with_default_image(mut self, image: impl Into<Bytes>) -> Self {
        self.default_image = image.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &dyn DeviceStore {
        self.store.as_ref()
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn orchestrator(&self) -> &RenderOrchestrator {
        &self.orchestrator
    }

    pub fn default_image(&self) -> Bytes {
        self.default_image.clone()
    }

    /// Token cancelled when the server shuts down. Sessions derive theirs from it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Ask every session to close.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down device sessions");
        self.shutdown.cancel();
    }

    /// Load a device, treating absence as an error.
    pub async fn device(&self, id: &str) -> Result<Device> {
        self.store
            .device(id)
            .await?
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))
    }

    /// Choose the next installation frame and advance the rotation cursor.
    pub async fn next_frame(&self, device: &Device, now: DateTime<Utc>) -> Option<Frame> {
        let selection = determine_next(&self.orchestrator, device, now).await?;

        if selection.index != device.last_app_index {
            if let Err(e) = self
                .store
                .update_device(&device.id, DeviceUpdate::LastAppIndex(selection.index))
                .await
            {
                tracing::warn!("Failed to save rotation index for {}: {}", device.id, e);
            }
        }

        Some(Frame {
            image: selection.image,
            dwell_secs: device.dwell_secs_for(Some(&selection.installation)),
            installation: Some(selection.installation.iname),
        })
    }

    /// Tell the owner's dashboard that this device changed.
    pub fn notify_dashboard(&self, device: &Device) {
        if let Some(owner) = &device.owner {
            self.notifier.notify(&user_key(owner), Notification::Refresh);
        }
    }
}
