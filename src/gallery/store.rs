//! Capacity-bounded artifact store with confirm/cancel eviction
//!
//! Every user's artifacts live in memory as an ordered set (oldest first),
//! mirrored to a `BlobStore`. All mutations for one user run under that
//! user's exclusion token, so a handler suspended on blob I/O never
//! interleaves its mutation with another handler for the same user.
//!
//! A store request at capacity does not evict anything. It opens a
//! `PendingEviction` naming the oldest artifact; the caller decides with
//! `confirm_eviction` or `cancel_eviction`. Unanswered proposals expire and
//! count as cancelled.

use super::blob::BlobStore;
use super::pending::PendingArena;
use super::types::{
    normalize_name, Artifact, EvictionOutcome, EvictionToken, IncomingArtifact, PendingEviction,
    Selector, StoreOutcome, UserId,
};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-user artifact galleries
pub struct ArtifactStore {
    blobs: Arc<dyn BlobStore>,
    capacity: usize,
    pending_ttl: chrono::Duration,
    sets: RwLock<HashMap<UserId, Vec<Artifact>>>,
    pending: RwLock<PendingArena>,
    locks: KeyedLocks<UserId>,
    seq: AtomicU64,
}

impl ArtifactStore {
    /// Create an empty store; call `init` to load what the blob store holds
    pub fn new(blobs: Arc<dyn BlobStore>, config: &StorageConfig) -> Self {
        let pending_ttl = chrono::Duration::from_std(config.pending_ttl())
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self {
            blobs,
            capacity: config.capacity.max(1),
            pending_ttl,
            sets: RwLock::new(HashMap::new()),
            pending: RwLock::new(PendingArena::new()),
            locks: KeyedLocks::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Create a store and load every user's gallery from the blob store
    pub async fn open(blobs: Arc<dyn BlobStore>, config: &StorageConfig) -> Result<Self> {
        let store = Self::new(blobs, config);
        store.init().await?;
        Ok(store)
    }

    /// Load every user's gallery from the blob store, replacing memory state.
    ///
    /// Open eviction proposals do not survive this; they are dropped.
    pub async fn init(&self) -> Result<()> {
        let mut loaded = HashMap::new();
        let mut total = 0usize;

        for user_id in self.blobs.identities().await? {
            let mut entries = self.blobs.list(user_id).await?;
            entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));

            let mut set = Vec::with_capacity(entries.len());
            for entry in entries {
                let payload = match self.blobs.read(user_id, &entry.name).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(user = user_id, name = %entry.name, "Skipping unreadable artifact: {}", e);
                        continue;
                    }
                };
                set.push(Artifact {
                    user_id,
                    name: entry.name,
                    created_at: entry.created_at,
                    seq: self.next_seq(),
                    payload,
                });
            }

            if set.len() > self.capacity {
                tracing::warn!(
                    user = user_id,
                    count = set.len(),
                    capacity = self.capacity,
                    "Gallery exceeds capacity; new artifacts will require eviction"
                );
            }
            total += set.len();
            if !set.is_empty() {
                loaded.insert(user_id, set);
            }
        }

        let users = loaded.len();
        *self.sets.write().await = loaded;
        self.pending.write().await.clear();

        tracing::info!(users, artifacts = total, "Artifact store loaded");
        Ok(())
    }

    /// Drop all in-memory galleries and open proposals. Blobs are untouched.
    pub async fn reset(&self) {
        self.sets.write().await.clear();
        self.pending.write().await.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A user's artifacts, oldest first
    pub async fn list(&self, user_id: UserId) -> Vec<Artifact> {
        self.sets
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The single artifact a selector resolves to
    pub async fn get(&self, user_id: UserId, selector: &Selector) -> Result<Artifact> {
        if selector.is_all() {
            return Err(Error::NotFound(
                "ordinal 0 selects every artifact, not one".to_string(),
            ));
        }
        let set = self.list(user_id).await;
        selector
            .position(&set)
            .map(|idx| set[idx].clone())
            .ok_or_else(|| Error::NotFound(format!("no artifact matches {}", selector)))
    }

    /// The user's open eviction proposal, if still live
    pub async fn pending(&self, user_id: UserId) -> Option<PendingEviction> {
        self.pending
            .write()
            .await
            .live_for_user(user_id, Utc::now())
            .cloned()
    }

    /// Store an artifact, or propose evicting the oldest one when full
    pub async fn store(&self, user_id: UserId, name: &str, payload: Bytes) -> Result<StoreOutcome> {
        let name = normalize_name(name)?;
        let _guard = self.locks.lock(&user_id).await;
        let now = Utc::now();

        if self.pending.write().await.live_for_user(user_id, now).is_some() {
            return Err(Error::ConflictInProgress(user_id));
        }

        let current = self.list(user_id).await;
        if current.iter().any(|a| a.name == name) {
            return Err(Error::DuplicateName(name));
        }

        if current.len() >= self.capacity {
            let candidate = current
                .iter()
                .min_by(|a, b| a.cmp_age(b))
                .cloned()
                .ok_or_else(|| Error::Internal("full gallery has no oldest artifact".to_string()))?;
            let token = EvictionToken::generate();
            let expires_at = now + self.pending_ttl;

            self.pending.write().await.open(
                PendingEviction {
                    user_id,
                    token: token.clone(),
                    candidate: candidate.clone(),
                    incoming: IncomingArtifact { name, payload },
                    expires_at,
                },
                now,
            )?;

            tracing::info!(
                user = user_id,
                token = %token,
                candidate = %candidate.name,
                "Gallery full, eviction awaiting confirmation"
            );

            return Ok(StoreOutcome::PendingConfirmation {
                token,
                candidate,
                expires_at,
            });
        }

        let created_at = self.blobs.write(user_id, &name, &payload).await?;
        let artifact = Artifact {
            user_id,
            name,
            created_at,
            seq: self.next_seq(),
            payload,
        };
        self.insert(artifact.clone()).await;

        tracing::info!(user = user_id, name = %artifact.name, size = artifact.size(), "Stored artifact");
        Ok(StoreOutcome::Stored(artifact))
    }

    /// Evict the proposal's candidate and store its incoming artifact
    pub async fn confirm_eviction(&self, token: &EvictionToken) -> Result<EvictionOutcome> {
        let user_id = self.owner(token).await?;
        let _guard = self.locks.lock(&user_id).await;

        let pending = self.pending.write().await.take(token, Utc::now())?;

        match self.apply_eviction(&pending).await {
            Ok(outcome) => {
                tracing::info!(
                    user = user_id,
                    token = %token,
                    evicted = %outcome.evicted.name,
                    stored = %outcome.stored.name,
                    "Eviction confirmed"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(user = user_id, token = %token, "Eviction failed, proposal kept open: {}", e);
                self.pending.write().await.restore(pending);
                Err(e)
            }
        }
    }

    /// Discard the proposal's incoming artifact, leaving the gallery as is
    pub async fn cancel_eviction(&self, token: &EvictionToken) -> Result<PendingEviction> {
        let user_id = self.owner(token).await?;
        let _guard = self.locks.lock(&user_id).await;

        let pending = self.pending.write().await.take(token, Utc::now())?;
        tracing::info!(user = user_id, token = %token, "Eviction cancelled");
        Ok(pending)
    }

    /// Delete one artifact, or every artifact for `Selector::Ordinal(0)`.
    ///
    /// A deletion implicitly cancels the user's open eviction proposal.
    pub async fn delete(&self, user_id: UserId, selector: &Selector) -> Result<Vec<Artifact>> {
        if selector.is_all() {
            return self.delete_all(user_id).await;
        }

        let _guard = self.locks.lock(&user_id).await;
        let current = self.list(user_id).await;
        let target = selector
            .position(&current)
            .map(|idx| current[idx].clone())
            .ok_or_else(|| Error::NotFound(format!("no artifact matches {}", selector)))?;

        self.blobs.remove(user_id, &target.name).await?;
        self.remove_from_set(user_id, &target.name).await;
        self.discard_pending(user_id).await;

        tracing::info!(user = user_id, name = %target.name, "Deleted artifact");
        Ok(vec![target])
    }

    /// Delete every artifact a user owns
    pub async fn delete_all(&self, user_id: UserId) -> Result<Vec<Artifact>> {
        let _guard = self.locks.lock(&user_id).await;

        let mut removed = Vec::new();
        for artifact in self.list(user_id).await {
            // Blobs already removed stay removed; the set tracks exactly what is left
            self.blobs.remove(user_id, &artifact.name).await?;
            self.remove_from_set(user_id, &artifact.name).await;
            if removed.is_empty() {
                // The gallery changed, so the proposal no longer applies
                self.discard_pending(user_id).await;
            }
            removed.push(artifact);
        }

        if !removed.is_empty() {
            tracing::info!(user = user_id, count = removed.len(), "Deleted all artifacts");
        }
        Ok(removed)
    }

    /// Drop every expired proposal, returning how many were dropped
    pub async fn sweep_expired(&self) -> usize {
        let swept = self.pending.write().await.sweep(Utc::now());
        for pending in &swept {
            tracing::info!(
                user = pending.user_id,
                token = %pending.token,
                "Eviction proposal expired, incoming artifact discarded"
            );
        }
        swept.len()
    }

    async fn owner(&self, token: &EvictionToken) -> Result<UserId> {
        self.pending
            .read()
            .await
            .owner(token)
    }

    async fn apply_eviction(&self, pending: &PendingEviction) -> Result<EvictionOutcome> {
        let user_id = pending.user_id;
        let incoming = &pending.incoming;

        let created_at = self.blobs.write(user_id, &incoming.name, &incoming.payload).await?;
        if let Err(e) = self.blobs.remove(user_id, &pending.candidate.name).await {
            if let Err(rollback) = self.blobs.remove(user_id, &incoming.name).await {
                tracing::error!(
                    user = user_id,
                    name = %incoming.name,
                    "Failed to roll back staged artifact: {}",
                    rollback
                );
            }
            return Err(e);
        }

        let stored = Artifact {
            user_id,
            name: incoming.name.clone(),
            created_at,
            seq: self.next_seq(),
            payload: incoming.payload.clone(),
        };
        let evicted = self
            .remove_from_set(user_id, &pending.candidate.name)
            .await
            .unwrap_or_else(|| pending.candidate.clone());
        self.insert(stored.clone()).await;

        Ok(EvictionOutcome { evicted, stored })
    }

    async fn discard_pending(&self, user_id: UserId) {
        if let Some(pending) = self.pending.write().await.discard_for_user(user_id) {
            tracing::info!(user = user_id, token = %pending.token, "Eviction proposal cancelled by deletion");
        }
    }

    async fn insert(&self, artifact: Artifact) {
        let mut sets = self.sets.write().await;
        let set = sets.entry(artifact.user_id).or_default();
        let idx = set.partition_point(|a| a.cmp_age(&artifact).is_lt());
        set.insert(idx, artifact);
    }

    async fn remove_from_set(&self, user_id: UserId, name: &str) -> Option<Artifact> {
        let mut sets = self.sets.write().await;
        let set = sets.get_mut(&user_id)?;
        let idx = set.iter().position(|a| a.name == name)?;
        let removed = set.remove(idx);
        if set.is_empty() {
            sets.remove(&user_id);
        }
        Some(removed)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::blob::{BlobEntry, FsBlobStore, MemoryBlobStore};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::time::Duration;
    use tokio::sync::Notify;

    const USER: UserId = 100;

    fn config(capacity: usize) -> StorageConfig {
        StorageConfig {
            capacity,
            ..StorageConfig::default()
        }
    }

    fn make_store(capacity: usize) -> (ArtifactStore, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = ArtifactStore::new(blobs.clone(), &config(capacity));
        (store, blobs)
    }

    async fn fill(store: &ArtifactStore, user_id: UserId, count: usize) {
        for i in 1..=count {
            let outcome = store
                .store(user_id, &format!("a{}", i), Bytes::from(format!("payload-{}", i)))
                .await
                .unwrap();
            assert!(matches!(outcome, StoreOutcome::Stored(_)));
        }
    }

    fn names(set: &[Artifact]) -> Vec<String> {
        set.iter().map(|a| a.name.clone()).collect()
    }

    fn expect_pending(outcome: StoreOutcome) -> (EvictionToken, Artifact) {
        match outcome {
            StoreOutcome::PendingConfirmation { token, candidate, .. } => (token, candidate),
            other => panic!("expected pending confirmation, got {:?}", other),
        }
    }

    fn is_sorted(set: &[Artifact]) -> bool {
        set.windows(2).all(|w| w[0].cmp_age(&w[1]).is_lt())
    }

    #[tokio::test]
    async fn test_list_empty() {
        let (store, _) = make_store(10);
        assert!(store.list(USER).await.is_empty());
    }

    #[tokio::test]
    async fn test_store_below_capacity() {
        let (store, blobs) = make_store(10);
        fill(&store, USER, 3).await;

        let before = store.list(USER).await.len();
        let outcome = store.store(USER, "fresh", Bytes::from_static(b"x")).await.unwrap();
        assert!(matches!(outcome, StoreOutcome::Stored(ref a) if a.name == "fresh"));

        let after = store.list(USER).await;
        assert_eq!(after.len(), before + 1);
        assert!(is_sorted(&after));
        assert!(store.pending(USER).await.is_none());
        assert_eq!(blobs.count(USER).await, 4);
    }

    #[tokio::test]
    async fn test_store_normalizes_and_rejects_names() {
        let (store, _) = make_store(10);
        store.store(USER, " my cpu ", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(names(&store.list(USER).await), vec!["my_cpu"]);

        let dup = store.store(USER, "my cpu", Bytes::from_static(b"y")).await;
        assert!(matches!(dup, Err(Error::DuplicateName(_))));

        let bad = store.store(USER, "../escape", Bytes::from_static(b"z")).await;
        assert!(matches!(bad, Err(Error::InvalidName(_))));
        assert_eq!(store.list(USER).await.len(), 1);
    }

    #[tokio::test]
    async fn test_store_non_ascii_name() {
        let (store, _) = make_store(10);
        let outcome = store.store(USER, "自作CPU", Bytes::from_static(b"png")).await.unwrap();
        assert!(matches!(outcome, StoreOutcome::Stored(ref a) if a.name == "自作CPU"));
        assert_eq!(
            store.get(USER, &Selector::Name("自作".to_string())).await.unwrap().name,
            "自作CPU"
        );
    }

    #[tokio::test]
    async fn test_full_gallery_confirm_evicts_oldest() {
        let (store, blobs) = make_store(10);
        fill(&store, USER, 10).await;
        let before = store.list(USER).await;

        let outcome = store.store(USER, "a11", Bytes::from_static(b"p")).await.unwrap();
        let (token, candidate) = expect_pending(outcome);
        assert_eq!(candidate.name, "a1");

        // Nothing changes until confirmation
        assert_eq!(store.list(USER).await, before);
        assert_eq!(blobs.count(USER).await, 10);

        let result = store.confirm_eviction(&token).await.unwrap();
        assert_eq!(result.evicted.name, "a1");
        assert_eq!(result.stored.name, "a11");

        let after = store.list(USER).await;
        let expected: Vec<String> = (2..=11).map(|i| format!("a{}", i)).collect();
        assert_eq!(names(&after), expected);
        assert!(is_sorted(&after));
        assert_eq!(blobs.count(USER).await, 10);
        assert!(store.pending(USER).await.is_none());

        // The token is spent
        assert!(matches!(store.confirm_eviction(&token).await, Err(Error::TokenUnknown(_))));
    }

    #[tokio::test]
    async fn test_full_gallery_cancel_leaves_set_identical() {
        let (store, blobs) = make_store(10);
        fill(&store, USER, 10).await;
        let before = store.list(USER).await;

        let (token, _) = expect_pending(store.store(USER, "a11", Bytes::from_static(b"p")).await.unwrap());
        let cancelled = store.cancel_eviction(&token).await.unwrap();
        assert_eq!(cancelled.incoming.name, "a11");

        let after = store.list(USER).await;
        assert_eq!(after, before);
        for (a, b) in after.iter().zip(before.iter()) {
            assert_eq!(a.payload, b.payload);
        }
        assert!(blobs.read(USER, "a11").await.is_err());
        assert!(store.pending(USER).await.is_none());

        // A new request may open a fresh proposal
        let outcome = store.store(USER, "a12", Bytes::from_static(b"q")).await.unwrap();
        assert!(matches!(outcome, StoreOutcome::PendingConfirmation { .. }));
    }

    #[tokio::test]
    async fn test_candidate_is_true_minimum_after_load() {
        let blobs = Arc::new(MemoryBlobStore::new());
        // Seed out of order; names sort differently than ages
        let times = [5, 1, 9, 3];
        for (i, t) in times.iter().enumerate() {
            blobs
                .insert_at(USER, &format!("z{}", i), Bytes::from_static(b"x"), Utc.timestamp_opt(*t, 0).unwrap())
                .await;
        }

        let store = ArtifactStore::open(blobs, &config(4)).await.unwrap();
        let listed = store.list(USER).await;
        assert_eq!(names(&listed), vec!["z1", "z3", "z0", "z2"]);

        let (_, candidate) = expect_pending(store.store(USER, "new", Bytes::from_static(b"n")).await.unwrap());
        assert_eq!(candidate.name, "z1");
    }

    #[tokio::test]
    async fn test_second_store_while_pending_conflicts() {
        let (store, _) = make_store(2);
        fill(&store, USER, 2).await;

        let _pending = store.store(USER, "x", Bytes::from_static(b"1")).await.unwrap();
        let second = store.store(USER, "y", Bytes::from_static(b"2")).await;
        assert!(matches!(second, Err(Error::ConflictInProgress(USER))));
    }

    #[tokio::test]
    async fn test_concurrent_stores_at_capacity_same_user() {
        let (store, _) = make_store(2);
        fill(&store, USER, 2).await;

        let (first, second) = futures::future::join(
            store.store(USER, "x", Bytes::from_static(b"1")),
            store.store(USER, "y", Bytes::from_static(b"2")),
        )
        .await;

        let results = [first, second];
        let pending = results
            .iter()
            .filter(|r| matches!(r, Ok(StoreOutcome::PendingConfirmation { .. })))
            .count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::ConflictInProgress(_))))
            .count();
        assert_eq!((pending, conflicts), (1, 1));
    }

    /// Blob store that parks writes for one user until released
    struct GatedBlobStore {
        inner: MemoryBlobStore,
        gated_user: UserId,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl BlobStore for GatedBlobStore {
        async fn write(&self, user_id: UserId, name: &str, payload: &[u8]) -> Result<DateTime<Utc>> {
            if user_id == self.gated_user {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.write(user_id, name, payload).await
        }
        async fn remove(&self, user_id: UserId, name: &str) -> Result<()> {
            self.inner.remove(user_id, name).await
        }
        async fn list(&self, user_id: UserId) -> Result<Vec<BlobEntry>> {
            self.inner.list(user_id).await
        }
        async fn read(&self, user_id: UserId, name: &str) -> Result<Bytes> {
            self.inner.read(user_id, name).await
        }
        async fn identities(&self) -> Result<Vec<UserId>> {
            self.inner.identities().await
        }
    }

    #[tokio::test]
    async fn test_distinct_users_do_not_block_each_other() {
        let blobs = Arc::new(GatedBlobStore {
            inner: MemoryBlobStore::new(),
            gated_user: 1,
            entered: Notify::new(),
            release: Notify::new(),
        });
        let store = Arc::new(ArtifactStore::new(blobs.clone(), &config(10)));

        let stalled = {
            let store = store.clone();
            tokio::spawn(async move { store.store(1, "slow", Bytes::from_static(b"s")).await })
        };
        blobs.entered.notified().await;

        // User 1 is parked mid-write while holding its exclusion token
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            store.store(2, "fast", Bytes::from_static(b"f")),
        )
        .await
        .expect("user 2 must not wait for user 1")
        .unwrap();
        assert!(matches!(other, StoreOutcome::Stored(_)));
        assert!(!stalled.is_finished());

        blobs.release.notify_one();
        let slow = stalled.await.unwrap().unwrap();
        assert!(matches!(slow, StoreOutcome::Stored(_)));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = ArtifactStore::new(
            blobs,
            &StorageConfig {
                capacity: 1,
                pending_ttl_secs: 0,
                ..StorageConfig::default()
            },
        );
        fill(&store, USER, 1).await;
        let before = store.list(USER).await;

        let (token, _) = expect_pending(store.store(USER, "late", Bytes::from_static(b"l")).await.unwrap());
        assert!(matches!(store.confirm_eviction(&token).await, Err(Error::TokenExpired(_))));
        assert_eq!(store.list(USER).await, before);

        // Expiry released the user; a new store opens a new proposal
        let outcome = store.store(USER, "again", Bytes::from_static(b"a")).await.unwrap();
        assert!(matches!(outcome, StoreOutcome::PendingConfirmation { .. }));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (store, _) = make_store(10);
        let token = EvictionToken::from("evict-missing");
        assert!(matches!(store.confirm_eviction(&token).await, Err(Error::TokenUnknown(_))));
        assert!(matches!(store.cancel_eviction(&token).await, Err(Error::TokenUnknown(_))));
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let expiring = ArtifactStore::new(
            Arc::new(MemoryBlobStore::new()),
            &StorageConfig {
                capacity: 1,
                pending_ttl_secs: 0,
                ..StorageConfig::default()
            },
        );
        fill(&expiring, USER, 1).await;
        let _ = expiring.store(USER, "b", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(expiring.sweep_expired().await, 1);
        assert_eq!(expiring.sweep_expired().await, 0);

        let (store, _) = make_store(1);
        fill(&store, USER, 1).await;
        let _ = store.store(USER, "b", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(store.sweep_expired().await, 0);
        assert!(store.pending(USER).await.is_some());
    }

    #[tokio::test]
    async fn test_token_swept_before_confirm_reads_as_expired() {
        let store = ArtifactStore::new(
            Arc::new(MemoryBlobStore::new()),
            &StorageConfig {
                capacity: 1,
                pending_ttl_secs: 0,
                ..StorageConfig::default()
            },
        );
        fill(&store, USER, 1).await;
        let (token, _) = expect_pending(store.store(USER, "b", Bytes::from_static(b"b")).await.unwrap());

        assert_eq!(store.sweep_expired().await, 1);
        assert!(matches!(store.confirm_eviction(&token).await, Err(Error::TokenExpired(_))));
        assert!(matches!(store.cancel_eviction(&token).await, Err(Error::TokenExpired(_))));
        assert_eq!(names(&store.list(USER).await), vec!["a1"]);
    }

    #[tokio::test]
    async fn test_token_dropped_by_next_store_reads_as_expired() {
        let store = ArtifactStore::new(
            Arc::new(MemoryBlobStore::new()),
            &StorageConfig {
                capacity: 1,
                pending_ttl_secs: 0,
                ..StorageConfig::default()
            },
        );
        fill(&store, USER, 1).await;
        let (first, _) = expect_pending(store.store(USER, "b", Bytes::from_static(b"b")).await.unwrap());
        let (second, _) = expect_pending(store.store(USER, "c", Bytes::from_static(b"c")).await.unwrap());
        assert_ne!(first, second);

        assert!(matches!(store.confirm_eviction(&first).await, Err(Error::TokenExpired(_))));
    }

    #[tokio::test]
    async fn test_delete_by_ordinal_and_name() {
        let (store, blobs) = make_store(10);
        fill(&store, USER, 4).await;

        let removed = store.delete(USER, &Selector::Ordinal(2)).await.unwrap();
        assert_eq!(names(&removed), vec!["a2"]);
        assert_eq!(names(&store.list(USER).await), vec!["a1", "a3", "a4"]);

        let removed = store.delete(USER, &Selector::Name("4".to_string())).await.unwrap();
        assert_eq!(names(&removed), vec!["a4"]);
        assert_eq!(names(&store.list(USER).await), vec!["a1", "a3"]);
        assert_eq!(blobs.count(USER).await, 2);
    }

    #[tokio::test]
    async fn test_delete_not_found_leaves_set_unchanged() {
        let (store, _) = make_store(10);
        fill(&store, USER, 3).await;
        let before = store.list(USER).await;

        assert!(matches!(store.delete(USER, &Selector::Ordinal(4)).await, Err(Error::NotFound(_))));
        assert!(matches!(
            store.delete(USER, &Selector::Name("zzz".to_string())).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(store.list(USER).await, before);
    }

    #[tokio::test]
    async fn test_delete_zero_empties_gallery() {
        let (store, blobs) = make_store(10);
        fill(&store, USER, 5).await;
        fill(&store, USER + 1, 2).await;

        let removed = store.delete(USER, &Selector::Ordinal(0)).await.unwrap();
        assert_eq!(removed.len(), 5);
        assert!(store.list(USER).await.is_empty());
        assert_eq!(blobs.count(USER).await, 0);

        // Other users untouched; repeat is a no-op
        assert_eq!(store.list(USER + 1).await.len(), 2);
        assert!(store.delete_all(USER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_all_keeps_proposal() {
        let (store, blobs) = make_store(2);
        fill(&store, USER, 2).await;
        let (token, _) = expect_pending(store.store(USER, "a3", Bytes::from_static(b"3")).await.unwrap());

        blobs.set_fail_removes(true);
        assert!(matches!(store.delete_all(USER).await, Err(Error::StorageIo(_))));
        assert_eq!(store.list(USER).await.len(), 2);
        assert_eq!(store.pending(USER).await.map(|p| p.token), Some(token.clone()));

        blobs.set_fail_removes(false);
        assert_eq!(store.delete_all(USER).await.unwrap().len(), 2);
        assert!(store.pending(USER).await.is_none());
        assert!(matches!(store.confirm_eviction(&token).await, Err(Error::TokenUnknown(_))));
    }

    #[tokio::test]
    async fn test_delete_cancels_open_proposal() {
        let (store, _) = make_store(3);
        fill(&store, USER, 3).await;

        let (token, _) = expect_pending(store.store(USER, "a4", Bytes::from_static(b"4")).await.unwrap());
        store.delete(USER, &Selector::Ordinal(1)).await.unwrap();

        assert!(store.pending(USER).await.is_none());
        assert!(matches!(store.confirm_eviction(&token).await, Err(Error::TokenUnknown(_))));

        // Room again, so the next store goes straight in
        let outcome = store.store(USER, "a4", Bytes::from_static(b"4")).await.unwrap();
        assert!(matches!(outcome, StoreOutcome::Stored(_)));
    }

    #[tokio::test]
    async fn test_get() {
        let (store, _) = make_store(10);
        fill(&store, USER, 3).await;

        assert_eq!(store.get(USER, &Selector::Ordinal(3)).await.unwrap().name, "a3");
        assert_eq!(
            store.get(USER, &Selector::Name("a2".to_string())).await.unwrap().payload,
            Bytes::from_static(b"payload-2")
        );
        assert!(matches!(store.get(USER, &Selector::Ordinal(0)).await, Err(Error::NotFound(_))));
        assert!(matches!(store.get(USER, &Selector::Ordinal(9)).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_write_failure_leaves_set_unchanged() {
        let (store, blobs) = make_store(10);
        fill(&store, USER, 2).await;
        let before = store.list(USER).await;

        blobs.set_fail_writes(true);
        let result = store.store(USER, "broken", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(Error::StorageIo(_))));
        assert_eq!(store.list(USER).await, before);
    }

    #[tokio::test]
    async fn test_confirm_failure_rolls_back_and_keeps_proposal() {
        let (store, blobs) = make_store(2);
        fill(&store, USER, 2).await;
        let before = store.list(USER).await;

        let (token, _) = expect_pending(store.store(USER, "a3", Bytes::from_static(b"3")).await.unwrap());

        blobs.set_fail_removes(true);
        assert!(matches!(store.confirm_eviction(&token).await, Err(Error::StorageIo(_))));
        assert_eq!(store.list(USER).await, before);
        assert!(store.pending(USER).await.is_some());

        blobs.set_fail_removes(false);
        // The rollback remove failed as well; a retried confirm overwrites the staged blob
        let outcome = store.confirm_eviction(&token).await.unwrap();
        assert_eq!(outcome.evicted.name, "a1");
        assert_eq!(names(&store.list(USER).await), vec!["a2", "a3"]);
        assert_eq!(blobs.count(USER).await, 2);
    }

    #[tokio::test]
    async fn test_confirm_write_failure_keeps_blobs_intact() {
        let (store, blobs) = make_store(2);
        fill(&store, USER, 2).await;

        let (token, _) = expect_pending(store.store(USER, "a3", Bytes::from_static(b"3")).await.unwrap());
        blobs.set_fail_writes(true);
        assert!(matches!(store.confirm_eviction(&token).await, Err(Error::StorageIo(_))));
        assert_eq!(blobs.count(USER).await, 2);

        blobs.set_fail_writes(false);
        store.cancel_eviction(&token).await.unwrap();
        assert_eq!(names(&store.list(USER).await), vec!["a1", "a2"]);
    }

    #[tokio::test]
    async fn test_init_loads_from_disk_and_reset_clears() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("artifacts");
        let cfg = StorageConfig {
            base_dir: base.clone(),
            ..config(10)
        };

        {
            let blobs = Arc::new(FsBlobStore::new(base.clone()).await.unwrap());
            let store = ArtifactStore::new(blobs, &cfg);
            store.store(USER, "first", Bytes::from_static(b"1")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.store(USER, "second", Bytes::from_static(b"2")).await.unwrap();
        }

        let blobs = Arc::new(FsBlobStore::new(base).await.unwrap());
        let store = ArtifactStore::open(blobs, &cfg).await.unwrap();
        let listed = store.list(USER).await;
        assert_eq!(names(&listed), vec!["first", "second"]);
        assert_eq!(listed[1].payload, Bytes::from_static(b"2"));

        store.reset().await;
        assert!(store.list(USER).await.is_empty());
    }
}
