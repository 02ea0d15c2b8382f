//! Choosing what a device shows next.
//!
//! Installations are sorted by `order` and, when interstitials are enabled,
//! the interstitial app is woven between every adjacent pair:
//!
//! ```text
//! [A, B, C] + interstitial I  =>  [A, I, B, I, C]
//! ```
//!
//! A pinned app, then an active night-mode app, is tried before the normal
//! scan. The scan starts after the last shown index and gives up after
//! visiting twice the sequence length, the pin or night app included.

use std::collections::HashSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::model::{Device, Installation};
use crate::render::RenderOrchestrator;
use crate::store::DeviceUpdate;

/// One position in the rotation sequence.
#[derive(Debug, Clone, Copy)]
pub struct Slot<'a> {
    pub installation: &'a Installation,
    /// Injected interstitial position
    pub interstitial: bool,
}

/// What rotation picked.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub installation: Installation,
    /// New cursor into the rotation sequence
    pub index: usize,
    pub image: Bytes,
}

/// Build the rotation sequence for a device.
pub fn rotation_sequence(device: &Device) -> Vec<Slot<'_>> {
    let mut sorted: Vec<&Installation> = device.installations.iter().collect();
    // sort_by_key is stable, equal orders keep their stored order
    sorted.sort_by_key(|i| i.order);

    let interstitial = interstitial_target(device);
    let mut sequence = Vec::with_capacity(sorted.len() * 2);
    for (n, installation) in sorted.iter().enumerate() {
        sequence.push(Slot {
            installation,
            interstitial: false,
        });
        if let Some(target) = interstitial {
            if n + 1 < sorted.len() {
                sequence.push(Slot {
                    installation: target,
                    interstitial: true,
                });
            }
        }
    }
    sequence
}

fn interstitial_target(device: &Device) -> Option<&Installation> {
    if !device.interstitial_enabled {
        return None;
    }
    device
        .interstitial_app
        .as_deref()
        .and_then(|iname| device.installation(iname))
}

/// Where the scan starts. An out-of-range cursor restarts at the beginning.
pub fn scan_start(last_index: usize, len: usize) -> usize {
    if last_index < len {
        (last_index + 1) % len
    } else {
        0
    }
}

struct Scan<'a> {
    device: &'a Device,
    pinned: Option<&'a str>,
    night_app: Option<&'a str>,
    local: DateTime<chrono_tz::Tz>,
}

impl Scan<'_> {
    fn eligible(&self, slot: &Slot<'_>) -> bool {
        if slot.interstitial {
            return true;
        }
        let installation = slot.installation;
        let iname = installation.iname.as_str();

        if self.pinned == Some(iname) || self.night_app == Some(iname) {
            return true;
        }
        if interstitial_target(self.device).is_some_and(|t| t.iname == iname)
            && !installation.enabled
        {
            return false;
        }
        installation.enabled && installation.schedule_active(&self.local)
    }
}

/// Pick the next installation for `device` and make sure its image exists.
///
/// Returns `None` when nothing is displayable; the caller then falls back
/// to the default image. A pinned app that fails to render is unpinned.
pub async fn determine_next(
    orchestrator: &RenderOrchestrator,
    device: &Device,
    now: DateTime<Utc>,
) -> Option<Selection> {
    determine_next_counted(orchestrator, device, now).await.0
}

/// [`determine_next`], also reporting how many candidates were visited.
pub(crate) async fn determine_next_counted(
    orchestrator: &RenderOrchestrator,
    device: &Device,
    now: DateTime<Utc>,
) -> (Option<Selection>, usize) {
    if device.effective_brightness(now) == 0 {
        tracing::debug!("{} brightness is 0, nothing to show", device.id);
        return (None, 0);
    }

    let sequence = rotation_sequence(device);
    if sequence.is_empty() {
        return (None, 0);
    }
    let len = sequence.len();
    let mut start = scan_start(device.last_app_index, len);
    let mut tried: HashSet<&str> = HashSet::new();

    let mut scan = Scan {
        device,
        pinned: device.pinned_app.as_deref(),
        night_app: device.active_night_app(now),
        local: device.local_now(now),
    };

    // The pin or night app attempt counts against the same 2 x len bound
    let bound = 2 * len;
    let mut visited = 0;
    if let Some(pinned) = scan.pinned.and_then(|p| device.installation(p)) {
        visited += 1;
        if let Some(image) = try_show(orchestrator, device, pinned, now).await {
            tracing::debug!("{} showing pinned {}", device.id, pinned.iname);
            let index = device.last_app_index.min(len - 1);
            return (Some(selection(pinned, index, image)), visited);
        }
        tried.insert(pinned.iname.as_str());
        unpin(orchestrator, device, pinned).await;
        scan.pinned = None;
        if let Some(position) = sequence
            .iter()
            .position(|s| !s.interstitial && s.installation.iname == pinned.iname)
        {
            start = (position + 1) % len;
        }
    } else if let Some(night) = scan.night_app.and_then(|n| device.installation(n)) {
        visited += 1;
        if let Some(image) = try_show(orchestrator, device, night, now).await {
            tracing::debug!("{} showing night app {}", device.id, night.iname);
            let index = device.last_app_index.min(len - 1);
            return (Some(selection(night, index, image)), visited);
        }
        tried.insert(night.iname.as_str());
    }

    let mut step = 0;
    while visited < bound {
        let index = (start + step) % len;
        let slot = sequence[index];
        step += 1;
        visited += 1;

        if !scan.eligible(&slot) || tried.contains(slot.installation.iname.as_str()) {
            continue;
        }

        let installation = slot.installation;
        if let Some(image) = try_show(orchestrator, device, installation, now).await {
            tracing::debug!(
                "{} next is {} at index {}",
                device.id,
                installation.iname,
                index
            );
            return (Some(selection(installation, index, image)), visited);
        }

        tried.insert(installation.iname.as_str());
        if scan.pinned == Some(installation.iname.as_str()) {
            unpin(orchestrator, device, installation).await;
            scan.pinned = None;
        }
    }

    tracing::debug!("{} has no displayable installation", device.id);
    (None, visited)
}

async fn try_show(
    orchestrator: &RenderOrchestrator,
    device: &Device,
    installation: &Installation,
    now: DateTime<Utc>,
) -> Option<Bytes> {
    if !orchestrator.ensure_fresh(device, installation, now).await {
        return None;
    }
    orchestrator.load(device, installation).await
}

async fn unpin(orchestrator: &RenderOrchestrator, device: &Device, installation: &Installation) {
    tracing::info!(
        "Pinned {} on {} is not displayable, unpinning",
        installation.iname,
        device.id
    );
    if let Err(e) = orchestrator
        .store()
        .update_device(&device.id, DeviceUpdate::PinnedApp(None))
        .await
    {
        tracing::warn!("Failed to unpin {}: {}", installation.iname, e);
    }
}

fn selection(installation: &Installation, index: usize, image: Bytes) -> Selection {
    Selection {
        installation: installation.clone(),
        index,
        image,
    }
}
