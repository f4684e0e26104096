//! Blob persistence for gallery artifacts
//!
//! Directory layout for `FsBlobStore`:
//! ```text
//! ~/.gallerybot/artifacts/
//! ├── <user-id>/
//! │   ├── <name>.bin
//! │   └── ...
//! └── ...
//! ```
//!
//! Writes stage into a dot-prefixed temp file in the same directory and are
//! committed with a rename, so a crash mid-write never leaves a partial
//! `<name>.bin` behind.

use super::types::UserId;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

const BLOB_EXTENSION: &str = "bin";

/// A stored blob as reported by `BlobStore::list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// File-or-object persistence for artifact payloads
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Atomically write (or replace) a blob
    async fn write(&self, user_id: UserId, name: &str, payload: &[u8]) -> Result<DateTime<Utc>>;

    /// Remove a blob; removing a missing blob is not an error
    async fn remove(&self, user_id: UserId, name: &str) -> Result<()>;

    /// List a user's blobs (no ordering guarantee)
    async fn list(&self, user_id: UserId) -> Result<Vec<BlobEntry>>;

    /// Read a blob's payload
    async fn read(&self, user_id: UserId, name: &str) -> Result<Bytes>;

    /// Every user that has a blob directory
    async fn identities(&self) -> Result<Vec<UserId>>;
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::StorageIo(format!("{}: {}", context, e))
}

/// Blob store backed by one directory per user
pub struct FsBlobStore {
    base_dir: PathBuf,
}

impl FsBlobStore {
    /// Create the store, ensuring the base directory exists
    pub async fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| storage_err(&base_dir.display().to_string(), e))?;

        tracing::info!(path = %base_dir.display(), "Blob store initialized");

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn user_dir(&self, user_id: UserId) -> PathBuf {
        self.base_dir.join(user_id.to_string())
    }

    fn blob_path(&self, user_id: UserId, name: &str) -> PathBuf {
        self.user_dir(user_id)
            .join(format!("{}.{}", name, BLOB_EXTENSION))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn write(&self, user_id: UserId, name: &str, payload: &[u8]) -> Result<DateTime<Utc>> {
        let dir = self.user_dir(user_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("create user directory", e))?;

        let path = self.blob_path(user_id, name);
        let temp_path = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

        let staged = async {
            let mut file = File::create(&temp_path)
                .await
                .map_err(|e| storage_err("create temp file", e))?;
            file.write_all(payload)
                .await
                .map_err(|e| storage_err("write temp file", e))?;
            file.sync_all()
                .await
                .map_err(|e| storage_err("sync temp file", e))?;
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = staged {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(storage_err("commit blob", e));
        }

        let created_at = fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        tracing::debug!(user = user_id, name, size = payload.len(), "Stored blob");
        Ok(created_at)
    }

    async fn remove(&self, user_id: UserId, name: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(user_id, name)).await {
            Ok(()) => {
                tracing::debug!(user = user_id, name, "Removed blob");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("remove blob", e)),
        }
    }

    async fn list(&self, user_id: UserId) -> Result<Vec<BlobEntry>> {
        let mut entries = match fs::read_dir(self.user_dir(user_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("read user directory", e)),
        };

        let mut blobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("read user directory", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let created_at = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(e) => {
                    tracing::warn!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };
            blobs.push(BlobEntry {
                name: name.to_string(),
                created_at,
            });
        }

        Ok(blobs)
    }

    async fn read(&self, user_id: UserId, name: &str) -> Result<Bytes> {
        match fs::read(self.blob_path(user_id, name)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(format!(
                "blob {} for user {}",
                name, user_id
            ))),
            Err(e) => Err(storage_err("read blob", e)),
        }
    }

    async fn identities(&self) -> Result<Vec<UserId>> {
        let mut entries = fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| storage_err("read base directory", e))?;

        let mut users = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("read base directory", e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            match entry.file_name().to_str().and_then(|s| s.parse::<UserId>().ok()) {
                Some(user_id) => users.push(user_id),
                None => tracing::debug!("Skipping non-user directory {:?}", entry.file_name()),
            }
        }

        Ok(users)
    }
}

/// In-memory blob store with failure injection, for tests and dry runs
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<(UserId, String), (Bytes, DateTime<Utc>)>>,
    fail_writes: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `StorageIo`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent remove fail with `StorageIo`
    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Number of blobs held for a user
    pub async fn count(&self, user_id: UserId) -> usize {
        self.blobs
            .read()
            .await
            .keys()
            .filter(|(u, _)| *u == user_id)
            .count()
    }

    /// Seed a blob with an explicit creation time
    pub async fn insert_at(&self, user_id: UserId, name: &str, payload: Bytes, created_at: DateTime<Utc>) {
        self.blobs
            .write()
            .await
            .insert((user_id, name.to_string()), (payload, created_at));
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, user_id: UserId, name: &str, payload: &[u8]) -> Result<DateTime<Utc>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StorageIo(format!("injected write failure for {}", name)));
        }
        let created_at = Utc::now();
        self.blobs.write().await.insert(
            (user_id, name.to_string()),
            (Bytes::copy_from_slice(payload), created_at),
        );
        Ok(created_at)
    }

    async fn remove(&self, user_id: UserId, name: &str) -> Result<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(Error::StorageIo(format!("injected remove failure for {}", name)));
        }
        self.blobs.write().await.remove(&(user_id, name.to_string()));
        Ok(())
    }

    async fn list(&self, user_id: UserId) -> Result<Vec<BlobEntry>> {
        Ok(self
            .blobs
            .read()
            .await
            .iter()
            .filter(|((u, _), _)| *u == user_id)
            .map(|((_, name), (_, created_at))| BlobEntry {
                name: name.clone(),
                created_at: *created_at,
            })
            .collect())
    }

    async fn read(&self, user_id: UserId, name: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(&(user_id, name.to_string()))
            .map(|(payload, _)| payload.clone())
            .ok_or_else(|| Error::NotFound(format!("blob {} for user {}", name, user_id)))
    }

    async fn identities(&self) -> Result<Vec<UserId>> {
        let mut users: Vec<UserId> = self.blobs.read().await.keys().map(|(u, _)| *u).collect();
        users.sort_unstable();
        users.dedup();
        Ok(users)
    }
}
