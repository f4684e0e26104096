//! Gallerybot - per-user image galleries and departure notices for Discord
//!
//! Gallerybot keeps a small, capacity-bounded gallery of named images for
//! every user and reports why members leave a guild, using the moderation
//! audit log to tell voluntary departures from kicks and bans.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Dispatcher                            │
//! │     one task per signal, replies over oneshot channels         │
//! └───────┬──────────────────────┬───────────────────────┬─────────┘
//!         │                      │                       │
//! ┌───────▼─────────┐   ┌────────▼──────────┐   ┌────────▼────────┐
//! │  ArtifactStore  │   │  EventAttributor  │   │ PlayerRegistry  │
//! │  - capacity     │   │  - audit polling  │   │ CpuInfoRegistry │
//! │  - eviction     │   │  - tie-breaking   │   └─────────────────┘
//! │    proposals    │   │  - ban suppression│
//! └───────┬─────────┘   └────────┬──────────┘
//!         │                      │
//! ┌───────▼─────────┐   ┌────────▼──────────┐   ┌─────────────────┐
//! │    BlobStore    │   │  AuditLogReader   │   │NotificationSink │
//! │  fs / memory    │   │  discord / memory │   │ discord / log   │
//! └─────────────────┘   └───────────────────┘   └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`gallery`]: artifact galleries, blob storage and eviction proposals
//! - [`attribution`]: departure classification against the audit log
//! - [`players`]: login-streak player registry
//! - [`cpuinfo`]: shared CPU design registry
//! - [`dispatch`]: signal dispatcher and its handle
//! - [`discord`]: Discord REST client
//! - [`notify`]: notification sinks
//! - [`locks`]: per-key exclusion tokens
//! - [`config`]: Configuration management

pub mod attribution;
pub mod config;
pub mod cpuinfo;
pub mod discord;
pub mod dispatch;
pub mod error;
pub mod gallery;
pub mod locks;
pub mod notify;
pub mod players;

pub use attribution::{Classification, EventAttributor, MembershipEvent, SignalKind};
pub use config::GalleryBotConfig;
pub use cpuinfo::{CpuInfo, CpuInfoBundle, CpuInfoRegistry};
pub use dispatch::{Dispatcher, DispatcherHandle, SignalFeed, SignalRecord};
pub use error::{Error, Result};
pub use gallery::{ArtifactStore, Selector, StoreOutcome};
pub use players::PlayerRegistry;
