//! Durable per-disk key/value metadata.
//!
//! Each disk name owns a flat map of string properties (`resume_image`,
//! `disk_mount_<n>`, ...). The whole store is one JSON document that is
//! rewritten atomically after every mutation, so a crash leaves either the
//! old or the new document on disk, never a torn one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::debug;

/// Properties of a single disk image.
pub type DiskProperties = BTreeMap<String, String>;

type Document = BTreeMap<String, DiskProperties>;

#[derive(Debug)]
pub struct MetadataStore {
    path: Option<PathBuf>,
    doc: Mutex<Document>,
}

impl MetadataStore {
    /// Open (or start) the store backed by `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let doc = if path.exists() {
            let raw = std::fs::read(path)
                .with_context(|| format!("read metadata {}", path.display()))?;
            serde_json::from_slice(&raw)
                .with_context(|| format!("parse metadata {}", path.display()))?
        } else {
            Document::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            doc: Mutex::new(doc),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(Document::new()),
        }
    }

    pub fn get(&self, disk: &str, key: &str) -> Option<String> {
        self.lock().get(disk).and_then(|props| props.get(key).cloned())
    }

    pub fn set(&self, disk: &str, key: &str, value: &str) -> Result<()> {
        self.update(disk, |props| {
            props.insert(key.to_string(), value.to_string());
        })
    }

    pub fn remove(&self, disk: &str, key: &str) -> Result<()> {
        self.update(disk, |props| {
            props.remove(key);
        })
    }

    /// Copy of every property recorded for `disk`.
    pub fn properties(&self, disk: &str) -> DiskProperties {
        self.lock().get(disk).cloned().unwrap_or_default()
    }

    /// Run `f` against the properties of `disk` and persist the result, all
    /// under one lock. Read-modify-write sequences must go through here.
    pub fn update<T>(&self, disk: &str, f: impl FnOnce(&mut DiskProperties) -> T) -> Result<T> {
        let mut doc = self.lock();
        let out = f(doc.entry(disk.to_string()).or_default());

        if let Some(path) = &self.path {
            let raw = serde_json::to_vec_pretty(&*doc).context("serialise metadata")?;
            write_atomic(path, &raw)?;
            debug!(disk = %disk, path = %path.display(), "metadata persisted");
        }
        Ok(out)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Document> {
        match self.doc.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
