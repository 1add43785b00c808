// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable blob storage for results that are expensive to recompute.
//!
//! Only exact volume exports are persisted: they take up to half an hour to
//! generate upstream, so a restart should reuse the last result when fresh.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::model::DateWindow;
use crate::volume::VolumeResolution;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Blob store rooted at a local directory; keys map to relative file paths.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are generated internally; strip anything that could escape the root.
        let sanitized: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '/' => c,
                _ => '_',
            })
            .collect();
        let relative = sanitized.replace("..", "_");
        self.root.join(relative.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so a crash never leaves a truncated blob behind.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = blobs.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(key).cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.insert(key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        blobs.remove(key);
        Ok(())
    }
}

/// JSON document persisted for an exact volume export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedVolume {
    pub window: DateWindow,
    pub stored_at: DateTime<Utc>,
    pub resolution: VolumeResolution,
}

pub fn exact_volume_key(window: &DateWindow) -> String {
    format!("volume/exact/{}_{}.json", window.start, window.end)
}

/// Persists an exact resolution for `window`.
pub async fn save_exact_volume(
    store: &dyn BlobStore,
    window: &DateWindow,
    resolution: &VolumeResolution,
) -> Result<(), StoreError> {
    let doc = PersistedVolume {
        window: *window,
        stored_at: Utc::now(),
        resolution: resolution.clone(),
    };
    let body = serde_json::to_vec(&doc)?;
    store.put(&exact_volume_key(window), body).await?;
    debug!("persisted exact volume for {window}");
    Ok(())
}

/// Loads a persisted exact resolution when it is younger than `max_age`.
///
/// Unreadable documents are treated as absent; the export simply runs again.
pub async fn load_exact_volume(
    store: &dyn BlobStore,
    window: &DateWindow,
    max_age: std::time::Duration,
) -> Result<Option<VolumeResolution>, StoreError> {
    let Some(body) = store.get(&exact_volume_key(window)).await? else {
        return Ok(None);
    };
    let doc: PersistedVolume = match serde_json::from_slice(&body) {
        Ok(doc) => doc,
        Err(err) => {
            warn!("ignoring unreadable persisted volume for {window}: {err}");
            return Ok(None);
        }
    };
    let max_age = ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::MAX);
    if Utc::now() - doc.stored_at > max_age {
        debug!("persisted volume for {window} is stale");
        return Ok(None);
    }
    Ok(Some(doc.resolution))
}
