//! Host folder access: raw paths and persistable access tokens.
//!
//! Both kinds of mount source resolve to the same thing, a live
//! [`HostHandle`] on an existing host directory. A token ("bookmark") is a
//! base64-encoded JSON [`AccessGrant`] that survives process restarts; it
//! goes stale once the folder it names is gone.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("access token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("access token is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("host folder {} is no longer available", .0.display())]
    Stale(PathBuf),
    #[error("host path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
}

/// A live handle on a host directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostHandle {
    path: PathBuf,
}

impl HostHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Serialized grant carried inside an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub path: PathBuf,
    pub granted_at: DateTime<Utc>,
}

impl AccessGrant {
    pub fn new(path: PathBuf) -> Self {
        Self { path, granted_at: Utc::now() }
    }

    pub fn encode(&self) -> String {
        // Serialising a struct of a path and a timestamp cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, AccessError> {
        let raw = STANDARD.decode(token.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Issue a persistable token for a folder the user just picked.
pub fn issue_token(path: &Path) -> Result<String, AccessError> {
    let handle = open_dir(path)?;
    Ok(AccessGrant::new(handle.path).encode())
}

/// Anything that can be turned into a live host directory.
pub trait MountSource: Send + Sync {
    fn resolve(&self) -> Result<HostHandle, AccessError>;

    /// Serialized token to store in the mount registry, if this source can
    /// be replayed in a later session.
    fn persistable_token(&self) -> Option<String>;
}

/// A raw host path, valid for this session only.
#[derive(Debug, Clone)]
pub struct DirectPath(pub PathBuf);

impl MountSource for DirectPath {
    fn resolve(&self) -> Result<HostHandle, AccessError> {
        open_dir(&self.0)
    }

    fn persistable_token(&self) -> Option<String> {
        None
    }
}

/// A base64 access token produced by [`issue_token`].
#[derive(Debug, Clone)]
pub struct BookmarkToken(pub String);

impl MountSource for BookmarkToken {
    fn resolve(&self) -> Result<HostHandle, AccessError> {
        let grant = AccessGrant::decode(&self.0)?;
        open_dir(&grant.path).map_err(|e| match e {
            AccessError::NotADirectory(p) => AccessError::NotADirectory(p),
            _ => AccessError::Stale(grant.path.clone()),
        })
    }

    fn persistable_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

fn open_dir(path: &Path) -> Result<HostHandle, AccessError> {
    let path = path
        .canonicalize()
        .map_err(|_| AccessError::Stale(path.to_path_buf()))?;
    if !path.is_dir() {
        return Err(AccessError::NotADirectory(path));
    }
    Ok(HostHandle { path })
}
