//! Polling delivery.
//!
//! Devices without a persistent connection ask for one image at a time.
//! A queued push always wins over rotation; when nothing is displayable
//! the default image goes out so the device always has something to show.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::engine::Engine;
use crate::model::{Transport, DEFAULT_DWELL_SECS};
use crate::protocol::{brightness_to_wire, MAX_WIRE_BRIGHTNESS};
use crate::store::DeviceUpdate;

/// Answer to one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PullResponse {
    pub image: Bytes,
    /// Brightness on the firmware's 0-255 scale
    pub brightness: u8,
    pub dwell_secs: u32,
    /// Installation the image came from, if any
    pub installation: Option<String>,
}

/// Produce the next image for a polling device.
///
/// Never fails: unknown devices and store errors get the default image.
pub async fn next_pull(engine: &Engine, device_id: &str, now: DateTime<Utc>) -> PullResponse {
    let fallback = PullResponse {
        image: engine.default_image(),
        brightness: MAX_WIRE_BRIGHTNESS,
        dwell_secs: DEFAULT_DWELL_SECS,
        installation: None,
    };

    let device = match engine.device(device_id).await {
        Ok(device) => device,
        Err(e) => {
            tracing::debug!("Serving default image to {}: {}", device_id, e);
            return fallback;
        }
    };

    let store = engine.store();
    for update in [
        DeviceUpdate::Transport(Transport::Http),
        DeviceUpdate::LastSeen(now),
    ] {
        if let Err(e) = store.update_device(&device.id, update).await {
            tracing::warn!("Failed to update {} bookkeeping: {}", device.id, e);
        }
    }

    let brightness = brightness_to_wire(device.effective_brightness(now));
    let dwell_secs = device.dwell_secs_for(None);

    match engine.images().take_next_push(&device.id).await {
        Ok(Some(image)) => {
            tracing::debug!("Serving queued push to {}", device.id);
            return PullResponse {
                image,
                brightness,
                dwell_secs,
                installation: None,
            };
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("Failed to read push queue for {}: {}", device.id, e),
    }

    match engine.next_frame(&device, now).await {
        Some(frame) => PullResponse {
            image: frame.image,
            brightness,
            dwell_secs: frame.dwell_secs,
            installation: frame.installation,
        },
        None => PullResponse {
            image: engine.default_image(),
            brightness,
            dwell_secs,
            installation: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, Installation};
    use crate::store::DeviceStore;
    use crate::testing::{at, test_engine};

    fn app(iname: &str, order: i32) -> Installation {
        Installation::new(iname, "app")
            .with_order(order)
            .with_app_path(format!("{}.star", iname))
    }

    #[tokio::test]
    async fn test_unknown_device_gets_default() {
        let t = test_engine([]);
        let response = next_pull(&t.engine, "ghost", at(12, 0)).await;
        assert_eq!(response.image, t.engine.default_image());
        assert_eq!(response.brightness, 255);
        assert_eq!(response.dwell_secs, DEFAULT_DWELL_SECS);
    }

    #[tokio::test]
    async fn test_rotation_and_bookkeeping() {
        let mut device = Device::new("tile-1")
            .with_installation(app("a", 0))
            .with_installation(app("b", 1));
        device.brightness = 40;
        let t = test_engine([device]);

        let response = next_pull(&t.engine, "tile-1", at(12, 0)).await;
        assert_eq!(response.image, Bytes::from_static(b"img:b.star"));
        assert_eq!(response.installation.as_deref(), Some("b"));
        assert_eq!(response.brightness, 102);

        let stored = t.store.device("tile-1").await.unwrap().unwrap();
        assert_eq!(stored.protocol.transport, Some(Transport::Http));
        assert_eq!(stored.last_seen, Some(at(12, 0)));
        assert_eq!(stored.last_app_index, 1);

        let response = next_pull(&t.engine, "tile-1", at(12, 1)).await;
        assert_eq!(response.installation.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_queued_pushes_served_first_in_order() {
        let device = Device::new("tile-1").with_installation(app("a", 0));
        let t = test_engine([device]);
        t.engine.images().enqueue_push("tile-1", b"one").await.unwrap();
        t.engine.images().enqueue_push("tile-1", b"two").await.unwrap();

        let first = next_pull(&t.engine, "tile-1", at(12, 0)).await;
        assert_eq!(first.image, Bytes::from_static(b"one"));
        assert_eq!(first.installation, None);
        let second = next_pull(&t.engine, "tile-1", at(12, 0)).await;
        assert_eq!(second.image, Bytes::from_static(b"two"));
        let third = next_pull(&t.engine, "tile-1", at(12, 0)).await;
        assert_eq!(third.image, Bytes::from_static(b"img:a.star"));
        assert_eq!(t.renderer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_nothing_displayable_gets_default() {
        let mut device = Device::new("tile-1").with_installation(app("a", 0));
        device.brightness = 0;
        let t = test_engine([device]);

        let response = next_pull(&t.engine, "tile-1", at(12, 0)).await;
        assert_eq!(response.image, t.engine.default_image());
        assert_eq!(response.brightness, 0);
        assert_eq!(t.renderer.call_count(), 0);

        let empty = test_engine([Device::new("tile-2")]);
        let response = next_pull(&empty.engine, "tile-2", at(12, 0)).await;
        assert_eq!(response.image, empty.engine.default_image());
    }
}
