//! Fixtures shared by unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::model::Device;
use crate::render::{RenderOutput, RenderRequest, Renderer};
use crate::store::{DeviceStore, DeviceUpdate, MemoryStore, RenderOutcome};

/// 2024-03-04 (a Monday) at `h:m` UTC.
pub(crate) fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Succeed,
    Fail,
    Empty,
    Hang,
}

/// Renderer that returns `img:<app file name>` unless told otherwise.
#[derive(Debug, Default)]
pub(crate) struct FakeRenderer {
    behaviors: Mutex<HashMap<String, Behavior>>,
    requests: Mutex<Vec<RenderRequest>>,
}

impl FakeRenderer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn set(&self, app: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(app.to_string(), behavior);
    }

    pub(crate) fn succeed(&self, app: &str) {
        self.set(app, Behavior::Succeed);
    }

    pub(crate) fn fail(&self, app: &str) {
        self.set(app, Behavior::Fail);
    }

    pub(crate) fn empty(&self, app: &str) {
        self.set(app, Behavior::Empty);
    }

    pub(crate) fn hang(&self, app: &str) {
        self.set(app, Behavior::Hang);
    }

    pub(crate) fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// App file names, in call order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| file_name(r))
            .collect()
    }

    pub(crate) fn last_request(&self) -> Option<RenderRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

fn file_name(request: &RenderRequest) -> String {
    request
        .app_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderOutput> {
        let app = file_name(request);
        self.requests.lock().unwrap().push(request.clone());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&app)
            .copied()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => Ok(RenderOutput {
                image: format!("img:{}", app).into_bytes(),
                messages: Vec::new(),
            }),
            Behavior::Fail => Err(Error::Render(format!("{} crashed", app))),
            Behavior::Empty => Ok(RenderOutput::default()),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(RenderOutput::default())
            }
        }
    }
}

/// Memory store that also logs every device update it is given.
#[derive(Debug)]
struct RecordingStore {
    inner: Arc<MemoryStore>,
    updates: Arc<Mutex<Vec<DeviceUpdate>>>,
}

#[async_trait]
impl DeviceStore for RecordingStore {
    async fn device(&self, id: &str) -> Result<Option<Device>> {
        self.inner.device(id).await
    }

    async fn update_device(&self, id: &str, update: DeviceUpdate) -> Result<u64> {
        self.updates.lock().unwrap().push(update.clone());
        self.inner.update_device(id, update).await
    }

    async fn record_render(
        &self,
        device_id: &str,
        iname: &str,
        outcome: &RenderOutcome,
    ) -> Result<u64> {
        self.inner.record_render(device_id, iname, outcome).await
    }
}

pub(crate) struct TestEngine {
    pub(crate) engine: Arc<Engine>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) renderer: Arc<FakeRenderer>,
    updates: Arc<Mutex<Vec<DeviceUpdate>>>,
    _dir: tempfile::TempDir,
}

impl TestEngine {
    /// Device updates the engine has written so far.
    pub(crate) fn updates(&self) -> Vec<DeviceUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

/// Engine over a memory store and fake renderer, caching in a temp dir.
pub(crate) fn test_engine(devices: impl IntoIterator<Item = Device>) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::from_devices(devices));
    let renderer = Arc::new(FakeRenderer::new());
    let config = Config::default()
        .with_data_dir(dir.path().join("data"))
        .with_apps_dir(dir.path().join("apps"));
    let updates = Arc::new(Mutex::new(Vec::new()));
    let recording = Arc::new(RecordingStore {
        inner: store.clone(),
        updates: updates.clone(),
    });
    let engine = Arc::new(Engine::new(config, recording, renderer.clone()));
    TestEngine {
        engine,
        store,
        renderer,
        updates,
        _dir: dir,
    }
}
