//! Audit trail readers
//!
//! The audit trail is the source of truth for moderation actions. It is
//! eventually consistent with the gateway: an entry may show up a few
//! seconds after the removal signal it explains.

use super::types::{AuditAction, AuditEntry, GuildId};
use crate::error::Result;
use crate::gallery::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Read access to a guild's moderation audit trail
#[async_trait]
pub trait AuditLogReader: Send + Sync {
    /// Entries for `target` with an action in `actions`, logged at or after
    /// `since`, newest first, at most `limit`
    async fn query(
        &self,
        guild_id: GuildId,
        actions: &[AuditAction],
        target: UserId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>>;
}

/// Audit entry tagged with its guild, as stored in fixture files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildAuditRecord {
    pub guild_id: GuildId,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

/// In-process audit trail
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: RwLock<HashMap<GuildId, Vec<AuditEntry>>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of `GuildAuditRecord`
    pub async fn load_json(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path).await?;
        let records: Vec<GuildAuditRecord> = serde_json::from_str(&data)?;
        let log = Self::new();
        for record in records {
            log.record(record.guild_id, record.entry).await;
        }
        Ok(log)
    }

    pub async fn record(&self, guild_id: GuildId, entry: AuditEntry) {
        self.entries
            .write()
            .await
            .entry(guild_id)
            .or_default()
            .push(entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditLogReader for MemoryAuditLog {
    async fn query(
        &self,
        guild_id: GuildId,
        actions: &[AuditAction],
        target: UserId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.read().await;
        let mut matched: Vec<AuditEntry> = entries
            .get(&guild_id)
            .map(|list| {
                list.iter()
                    .filter(|e| e.target == target)
                    .filter(|e| actions.contains(&e.action))
                    .filter(|e| e.occurred_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        matched.sort_by(|a, b| b.entry_id.cmp(&a.entry_id));
        matched.truncate(limit);
        Ok(matched)
    }
}
