//! Gallery data types
//!
//! An `Artifact` is one named image payload owned by a user. A user's
//! artifacts form an ordered set (oldest first) bounded by the configured
//! capacity. When a store request arrives at capacity the store hands back a
//! `PendingEviction` that must be confirmed or cancelled.

use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Discord user snowflake
pub type UserId = u64;

/// Maximum length of a normalized artifact name
pub const MAX_NAME_LEN: usize = 64;

/// One named binary artifact owned by a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub user_id: UserId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Insertion sequence, breaks `created_at` ties
    pub seq: u64,
    #[serde(skip)]
    pub payload: Bytes,
}

impl Artifact {
    /// Ordering key: creation time, then insertion sequence
    pub fn cmp_age(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.seq.cmp(&other.seq))
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// An artifact waiting to be inserted once an eviction is confirmed
#[derive(Debug, Clone)]
pub struct IncomingArtifact {
    pub name: String,
    pub payload: Bytes,
}

/// Opaque handle for an open eviction proposal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvictionToken(String);

impl EvictionToken {
    pub fn generate() -> Self {
        Self(format!("evict-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EvictionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for EvictionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An open, unconfirmed proposal to replace the oldest artifact
#[derive(Debug, Clone)]
pub struct PendingEviction {
    pub user_id: UserId,
    pub token: EvictionToken,
    pub candidate: Artifact,
    pub incoming: IncomingArtifact,
    pub expires_at: DateTime<Utc>,
}

impl PendingEviction {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a store request
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    /// Inserted immediately
    Stored(Artifact),
    /// Gallery is full; the caller must confirm or cancel evicting `candidate`
    PendingConfirmation {
        token: EvictionToken,
        candidate: Artifact,
        expires_at: DateTime<Utc>,
    },
}

/// Result of a confirmed eviction
#[derive(Debug, Clone)]
pub struct EvictionOutcome {
    pub evicted: Artifact,
    pub stored: Artifact,
}

/// Picks artifacts out of a user's gallery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// 1-based position, oldest first; 0 means every artifact
    Ordinal(usize),
    /// First artifact whose name contains this text
    Name(String),
}

impl Selector {
    /// Selects every artifact
    pub fn is_all(&self) -> bool {
        matches!(self, Selector::Ordinal(0))
    }

    /// Resolve against an ordered set, returning the index of the match
    pub fn position(&self, artifacts: &[Artifact]) -> Option<usize> {
        match self {
            Selector::Ordinal(0) => None,
            Selector::Ordinal(n) => (*n <= artifacts.len()).then(|| n - 1),
            Selector::Name(needle) => artifacts.iter().position(|a| a.name.contains(needle.as_str())),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Ordinal(0) => write!(f, "all"),
            Selector::Ordinal(n) => write!(f, "#{}", n),
            Selector::Name(name) => write!(f, "\"{}\"", name),
        }
    }
}

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[\p{L}\p{N}_\-][\p{L}\p{M}\p{N}_\-.]*$").ok())
        .as_ref()
}

/// Normalize a user-supplied artifact name into a file-safe one.
///
/// Surrounding whitespace is trimmed and inner spaces become `_`. Letters and
/// digits of any script are kept; path separators and a leading `.` are not.
pub fn normalize_name(raw: &str) -> Result<String> {
    let name = raw.trim().replace(' ', "_");
    if name.is_empty() {
        return Err(Error::InvalidName("name is empty".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "name is longer than {} characters",
            MAX_NAME_LEN
        )));
    }
    let pattern = name_pattern()
        .ok_or_else(|| Error::Internal("artifact name pattern failed to compile".to_string()))?;
    if !pattern.is_match(&name) {
        return Err(Error::InvalidName(name));
    }
    Ok(name)
}
