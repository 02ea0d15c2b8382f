//! Device-local rendered image store.
//!
//! Rendered installations live at `<root>/<device>/apps/<iname>/<app>.webp`,
//! one directory per installation id. Writes go to a temporary
//! file first and are renamed into place, so readers see either the old or
//! the new image, never a partial one.
//!
//! Ad hoc pushed images are queued under `<root>/<device>/pushed/` with
//! names that sort in arrival order and are consumed with
//! [`ImageStore::take_next_push`], which claims each file by renaming it
//! before reading. Two concurrent takers can never both get the same image.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::{Error, Result};

const IMAGE_EXT: &str = "webp";
const APPS_DIR: &str = "apps";
const PUSHED_DIR: &str = "pushed";

/// Identifies one cached image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    device_id: String,
    dirs: Vec<String>,
    name: String,
}

impl ImageKey {
    /// Cache key for an installation's rendered output.
    pub fn installation(device_id: &str, app_name: &str, iname: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            dirs: vec![APPS_DIR.to_string(), iname.to_string()],
            name: app_name.to_string(),
        }
    }

    fn pushed(device_id: &str, stem: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            dirs: vec![PUSHED_DIR.to_string()],
            name: stem.to_string(),
        }
    }
}

/// Filesystem-backed image store.
#[derive(Debug)]
pub struct ImageStore {
    root: PathBuf,
    counter: AtomicU64,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: AtomicU64::new(0),
        }
    }

    fn device_dir(&self, device_id: &str) -> Result<PathBuf> {
        check_component(device_id)?;
        Ok(self.root.join(device_id))
    }

    /// On-disk location for a key.
    pub fn path(&self, key: &ImageKey) -> Result<PathBuf> {
        let mut path = self.device_dir(&key.device_id)?;
        for dir in &key.dirs {
            check_component(dir)?;
            path.push(dir);
        }
        check_component(&key.name)?;
        path.push(format!("{}.{}", key.name, IMAGE_EXT));
        Ok(path)
    }

    /// Store an image, replacing any previous one.
    pub async fn put(&self, key: &ImageKey, image: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let tmp = path.with_extension(format!("{}.tmp", self.next_seq()));
        tokio::fs::write(&tmp, image)
            .await
            .map_err(|e| Error::Io(format!("Failed to write {}: {}", tmp.display(), e)))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Io(format!(
                "Failed to move image into {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }

    pub async fn get(&self, key: &ImageKey) -> Result<Option<Bytes>> {
        read_optional(&self.path(key)?).await
    }

    pub async fn exists(&self, key: &ImageKey) -> bool {
        match self.path(key) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Read and delete an image. Returns `None` if someone else got it first.
    pub async fn take(&self, key: &ImageKey) -> Result<Option<Bytes>> {
        let path = self.path(key)?;
        let claimed = path.with_extension(format!("{}.claimed", self.next_seq()));

        match tokio::fs::rename(&path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let image = tokio::fs::read(&claimed).await;
        let _ = tokio::fs::remove_file(&claimed).await;
        Ok(Some(Bytes::from(image?)))
    }

    /// Copy an existing image file into the store under `key`.
    pub async fn import(&self, key: &ImageKey, source: &Path) -> Result<()> {
        let image = tokio::fs::read(source)
            .await
            .map_err(|e| Error::Io(format!("Failed to read {}: {}", source.display(), e)))?;
        self.put(key, &image).await
    }

    /// Queue an ad hoc image for a polling device.
    pub async fn enqueue_push(&self, device_id: &str, image: &[u8]) -> Result<ImageKey> {
        let millis = chrono::Utc::now().timestamp_millis().max(0);
        let stem = format!("{:016}-{:010}", millis, self.next_seq());
        let key = ImageKey::pushed(device_id, &stem);
        self.put(&key, image).await?;
        Ok(key)
    }

    /// Take the oldest queued push for a device, deleting it.
    pub async fn take_next_push(&self, device_id: &str) -> Result<Option<Bytes>> {
        let dir = self.device_dir(device_id)?.join(PUSHED_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut stems = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(IMAGE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();

        for stem in stems {
            if let Some(image) = self.take(&ImageKey::pushed(device_id, &stem)).await? {
                return Ok(Some(image));
            }
        }
        Ok(None)
    }

    fn next_seq(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

async fn read_optional(path: &Path) -> Result<Option<Bytes>> {
    match tokio::fs::read(path).await {
        Ok(image) => Ok(Some(Bytes::from(image))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(format!("Failed to read {}: {}", path.display(), e))),
    }
}

fn check_component(part: &str) -> Result<()> {
    if part.is_empty()
        || part == "."
        || part == ".."
        || part.contains(['/', '\\'])
        || part.contains('\0')
    {
        return Err(Error::Io(format!("Invalid cache path component: {:?}", part)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        let key = ImageKey::installation("tile-1", "clock", "100");

        assert_eq!(store.get(&key).await.unwrap(), None);
        assert!(!store.exists(&key).await);

        store.put(&key, b"first").await.unwrap();
        store.put(&key, b"second").await.unwrap();
        assert!(store.exists(&key).await);
        assert_eq!(store.get(&key).await.unwrap().unwrap(), Bytes::from_static(b"second"));
        assert_eq!(
            store.path(&key).unwrap(),
            dir.path().join("tile-1").join("apps").join("100").join("clock.webp")
        );
    }

    #[tokio::test]
    async fn test_keys_do_not_collide_across_installations() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        let first = ImageKey::installation("tile-1", "a-b", "c");
        let second = ImageKey::installation("tile-1", "a", "b-c");
        assert_ne!(store.path(&first).unwrap(), store.path(&second).unwrap());

        store.put(&first, b"one").await.unwrap();
        store.put(&second, b"two").await.unwrap();
        assert_eq!(store.get(&first).await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(store.get(&second).await.unwrap().unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_installation_named_pushed_is_not_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        store
            .put(&ImageKey::installation("tile-1", "clock", "pushed"), b"render")
            .await
            .unwrap();
        assert_eq!(store.take_next_push("tile-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_take_is_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        let key = ImageKey::installation("tile-1", "clock", "100");
        store.put(&key, b"img").await.unwrap();

        assert_eq!(store.take(&key).await.unwrap().unwrap(), Bytes::from_static(b"img"));
        assert_eq!(store.take(&key).await.unwrap(), None);
        assert!(!store.exists(&key).await);
    }

    #[tokio::test]
    async fn test_pushes_are_fifo_and_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());

        assert_eq!(store.take_next_push("tile-1").await.unwrap(), None);

        store.enqueue_push("tile-1", b"one").await.unwrap();
        store.enqueue_push("tile-1", b"two").await.unwrap();
        store.enqueue_push("tile-2", b"other").await.unwrap();

        assert_eq!(store.take_next_push("tile-1").await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(store.take_next_push("tile-1").await.unwrap().unwrap(), Bytes::from_static(b"two"));
        assert_eq!(store.take_next_push("tile-1").await.unwrap(), None);
        assert!(store.take_next_push("tile-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_take_delivers_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(ImageStore::new(dir.path()));
        store.enqueue_push("tile-1", b"only").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.take_next_push("tile-1").await.unwrap()
            }));
        }
        let mut served = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                served += 1;
            }
        }
        assert_eq!(served, 1);
    }

    #[tokio::test]
    async fn test_import_static_image() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("logo.webp");
        std::fs::write(&source, b"logo").unwrap();

        let store = ImageStore::new(dir.path().join("cache"));
        let key = ImageKey::installation("tile-1", "logo", "7");
        store.import(&key, &source).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().unwrap(), Bytes::from_static(b"logo"));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let store = ImageStore::new("/tmp/tilecast");
        assert!(store.path(&ImageKey::installation("..", "clock", "1")).is_err());
        assert!(store.path(&ImageKey::installation("tile", "a/b", "1")).is_err());
        assert!(store.path(&ImageKey::installation("tile", "clock", "..")).is_err());
        assert!(store.path(&ImageKey::installation("tile", "clock", "1")).is_ok());
    }
}
