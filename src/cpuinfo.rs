//! Shared CPU design registry
//!
//! A user publishes a design under a name: the structure file and an
//! instruction image. Anyone can fetch it by name. The reply also carries the
//! owner's gallery image of the same name when one exists. Each name has a
//! single owner; saving an existing name again replaces it and moves
//! ownership to the new publisher.

use crate::error::{Error, Result};
use crate::gallery::{normalize_name, Artifact, ArtifactStore, BlobStore, UserId};
use crate::locks::KeyedLocks;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const STRUCTURE_SUFFIX: &str = ".mcstructure";
const INSTRUCTION_SUFFIX: &str = ".instruction";

/// A published design
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuInfo {
    pub name: String,
    pub owner: UserId,
    pub saved_at: DateTime<Utc>,
}

/// Everything returned for a lookup
#[derive(Debug, Clone)]
pub struct CpuInfoBundle {
    pub info: CpuInfo,
    pub structure: Bytes,
    pub instruction: Bytes,
    /// The owner's gallery image with exactly this name
    pub gallery: Option<Artifact>,
}

/// Name to owner index over a blob store keyed by owner
pub struct CpuInfoRegistry {
    blobs: Arc<dyn BlobStore>,
    gallery: Arc<ArtifactStore>,
    owners: RwLock<HashMap<String, CpuInfo>>,
    locks: KeyedLocks<String>,
}

impl CpuInfoRegistry {
    pub fn new(blobs: Arc<dyn BlobStore>, gallery: Arc<ArtifactStore>) -> Self {
        Self {
            blobs,
            gallery,
            owners: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    /// Create a registry and index what the blob store holds
    pub async fn open(blobs: Arc<dyn BlobStore>, gallery: Arc<ArtifactStore>) -> Result<Self> {
        let registry = Self::new(blobs, gallery);
        registry.init().await?;
        Ok(registry)
    }

    /// Rebuild the name index from the blob store.
    ///
    /// A design counts only when both of its files are present. If two owners
    /// hold the same name, the newer save wins.
    pub async fn init(&self) -> Result<()> {
        let mut index: HashMap<String, CpuInfo> = HashMap::new();

        for owner in self.blobs.identities().await? {
            let entries = self.blobs.list(owner).await?;
            let instructions: Vec<&str> = entries
                .iter()
                .filter_map(|e| e.name.strip_suffix(INSTRUCTION_SUFFIX))
                .collect();

            for entry in &entries {
                let Some(name) = entry.name.strip_suffix(STRUCTURE_SUFFIX) else {
                    continue;
                };
                if !instructions.contains(&name) {
                    tracing::warn!(owner, name, "Skipping design without an instruction image");
                    continue;
                }
                let info = CpuInfo {
                    name: name.to_string(),
                    owner,
                    saved_at: entry.created_at,
                };
                match index.get(name) {
                    Some(existing) if existing.saved_at >= info.saved_at => {}
                    _ => {
                        index.insert(info.name.clone(), info);
                    }
                }
            }
        }

        tracing::info!(designs = index.len(), "CPU registry loaded");
        *self.owners.write().await = index;
        Ok(())
    }

    /// Forget every indexed design; stored files are left alone
    pub async fn reset(&self) {
        self.owners.write().await.clear();
    }

    /// Publish a design under `name`
    pub async fn save(
        &self,
        owner: UserId,
        name: &str,
        structure: Bytes,
        instruction: Bytes,
    ) -> Result<CpuInfo> {
        let name = normalize_name(name)?;
        let _guard = self.locks.lock(&name).await;

        let structure_blob = format!("{}{}", name, STRUCTURE_SUFFIX);
        let instruction_blob = format!("{}{}", name, INSTRUCTION_SUFFIX);

        let saved_at = self.blobs.write(owner, &structure_blob, &structure).await?;
        if let Err(e) = self.blobs.write(owner, &instruction_blob, &instruction).await {
            let previous_owner = self.owners.read().await.get(&name).map(|i| i.owner);
            // Only roll back a structure nobody else relies on
            if previous_owner != Some(owner) {
                if let Err(rollback) = self.blobs.remove(owner, &structure_blob).await {
                    tracing::warn!(owner, name = %name, "Failed to roll back structure file: {}", rollback);
                }
            }
            return Err(e);
        }

        let info = CpuInfo {
            name: name.clone(),
            owner,
            saved_at,
        };
        let previous = self.owners.write().await.insert(name.clone(), info.clone());

        if let Some(previous) = previous.filter(|p| p.owner != owner) {
            for blob in [&structure_blob, &instruction_blob] {
                if let Err(e) = self.blobs.remove(previous.owner, blob).await {
                    tracing::warn!(owner = previous.owner, name = %name, "Failed to remove replaced design file: {}", e);
                }
            }
            tracing::info!(name = %name, from = previous.owner, to = owner, "Design ownership moved");
        }

        tracing::info!(owner, name = %name, "Design saved");
        Ok(info)
    }

    /// Fetch a design and the owner's matching gallery image
    pub async fn get(&self, name: &str) -> Result<CpuInfoBundle> {
        let name = normalize_name(name)?;
        let info = self
            .owners
            .read()
            .await
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no design named {}", name)))?;

        let structure = self
            .blobs
            .read(info.owner, &format!("{}{}", name, STRUCTURE_SUFFIX))
            .await?;
        let instruction = self
            .blobs
            .read(info.owner, &format!("{}{}", name, INSTRUCTION_SUFFIX))
            .await?;

        let gallery = self
            .gallery
            .list(info.owner)
            .await
            .into_iter()
            .find(|a| a.name == name);

        Ok(CpuInfoBundle {
            info,
            structure,
            instruction,
            gallery,
        })
    }

    /// Owner of a published name
    pub async fn owner(&self, name: &str) -> Option<UserId> {
        let name = normalize_name(name).ok()?;
        self.owners.read().await.get(&name).map(|i| i.owner)
    }

    pub async fn len(&self) -> usize {
        self.owners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.owners.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::gallery::{FsBlobStore, MemoryBlobStore};
    use tempfile::TempDir;

    fn registry() -> (CpuInfoRegistry, Arc<MemoryBlobStore>, Arc<ArtifactStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let gallery = Arc::new(ArtifactStore::new(
            Arc::new(MemoryBlobStore::new()),
            &StorageConfig::default(),
        ));
        (CpuInfoRegistry::new(blobs.clone(), gallery.clone()), blobs, gallery)
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let (registry, _, gallery) = registry();
        gallery
            .store(7, "risc cpu", Bytes::from_static(b"photo"))
            .await
            .unwrap();

        let info = registry
            .save(7, "risc cpu", Bytes::from_static(b"nbt"), Bytes::from_static(b"png"))
            .await
            .unwrap();
        assert_eq!(info.name, "risc_cpu");
        assert_eq!(info.owner, 7);

        let bundle = registry.get("risc cpu").await.unwrap();
        assert_eq!(bundle.info.owner, 7);
        assert_eq!(bundle.structure, Bytes::from_static(b"nbt"));
        assert_eq!(bundle.instruction, Bytes::from_static(b"png"));
        assert_eq!(bundle.gallery.unwrap().payload, Bytes::from_static(b"photo"));
    }

    #[tokio::test]
    async fn test_gallery_image_needs_exact_name() {
        let (registry, _, gallery) = registry();
        gallery
            .store(7, "risc_cpu_v2", Bytes::from_static(b"photo"))
            .await
            .unwrap();
        registry
            .save(7, "risc_cpu", Bytes::from_static(b"nbt"), Bytes::from_static(b"png"))
            .await
            .unwrap();

        assert!(registry.get("risc_cpu").await.unwrap().gallery.is_none());
    }

    #[tokio::test]
    async fn test_unknown_name() {
        let (registry, _, _) = registry();
        assert!(matches!(registry.get("nothing").await, Err(Error::NotFound(_))));
        assert!(matches!(registry.get("../etc").await, Err(Error::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_resave_moves_ownership() {
        let (registry, blobs, _) = registry();
        registry
            .save(1, "alu", Bytes::from_static(b"v1"), Bytes::from_static(b"i1"))
            .await
            .unwrap();
        registry
            .save(2, "alu", Bytes::from_static(b"v2"), Bytes::from_static(b"i2"))
            .await
            .unwrap();

        assert_eq!(registry.owner("alu").await, Some(2));
        assert_eq!(registry.get("alu").await.unwrap().structure, Bytes::from_static(b"v2"));
        assert_eq!(blobs.count(1).await, 0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_no_design() {
        let (registry, blobs, _) = registry();
        blobs.set_fail_writes(true);
        let err = registry
            .save(1, "alu", Bytes::from_static(b"v1"), Bytes::from_static(b"i1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageIo(_)));
        assert!(registry.is_empty().await);
        assert_eq!(blobs.count(1).await, 0);
    }

    #[tokio::test]
    async fn test_init_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        let gallery = Arc::new(ArtifactStore::new(
            Arc::new(MemoryBlobStore::new()),
            &StorageConfig::default(),
        ));

        {
            let blobs = Arc::new(FsBlobStore::new(dir.path().join("cpuinfo")).await.unwrap());
            let registry = CpuInfoRegistry::new(blobs.clone(), gallery.clone());
            registry
                .save(3, "8bit adder", Bytes::from_static(b"nbt"), Bytes::from_static(b"png"))
                .await
                .unwrap();
            // Half-written design: structure only
            blobs.write(3, "orphan.mcstructure", b"nbt").await.unwrap();
        }

        let blobs = Arc::new(FsBlobStore::new(dir.path().join("cpuinfo")).await.unwrap());
        let registry = CpuInfoRegistry::open(blobs, gallery).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.owner("8bit_adder").await, Some(3));
        assert_eq!(registry.owner("orphan").await, None);

        registry.reset().await;
        assert!(registry.is_empty().await);
    }
}
