//! Gallery: per-user artifact collections with a capacity bound
//!
//! Artifacts are named image payloads. Each user keeps at most `capacity`
//! of them; storing past the limit proposes evicting the oldest one and waits
//! for the user to confirm or cancel.

pub mod blob;
pub mod pending;
pub mod store;
pub mod types;

pub use blob::{BlobEntry, BlobStore, FsBlobStore, MemoryBlobStore};
pub use store::ArtifactStore;
pub use types::{
    normalize_name, Artifact, EvictionOutcome, EvictionToken, IncomingArtifact, PendingEviction,
    Selector, StoreOutcome, UserId,
};
