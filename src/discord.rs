//! Discord REST client
//!
//! Reads the guild audit log and posts departure notices. Gateway
//! connectivity lives outside this crate; signals reach the bot through the
//! dispatcher.

use crate::attribution::{AuditAction, AuditEntry, AuditLogReader, GuildId};
use crate::config::DiscordConfig;
use crate::error::{Error, Result};
use crate::gallery::UserId;
use crate::notify::NotificationSink;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// First millisecond of 2015, the origin of Discord snowflake timestamps
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Creation time encoded in a snowflake
pub fn snowflake_timestamp(id: u64) -> Option<DateTime<Utc>> {
    let ms = (id >> 22) + DISCORD_EPOCH_MS;
    Utc.timestamp_millis_opt(ms as i64).single()
}

pub struct DiscordClient {
    config: DiscordConfig,
    client: reqwest::Client,
    token: String,
}

impl DiscordClient {
    /// Create a client, resolving the bot token from the environment
    pub fn new(config: DiscordConfig) -> Result<Self> {
        let token = Self::resolve_credential(&config.bot_token_ref)?;
        Ok(Self::with_token(config, token))
    }

    pub fn with_token(config: DiscordConfig, token: impl Into<String>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            token: token.into(),
        }
    }

    /// Resolve credential from environment variable
    fn resolve_credential(credential_ref: &str) -> Result<String> {
        std::env::var(credential_ref).map_err(|_| {
            Error::Channel(format!(
                "Failed to resolve Discord bot token from env var: {}",
                credential_ref
            ))
        })
    }

    pub fn config(&self) -> &DiscordConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn fetch_audit_log(
        &self,
        guild_id: GuildId,
        action: AuditAction,
        limit: usize,
    ) -> Result<AuditLogResponse> {
        let url = self.url(&format!("/guilds/{}/audit-logs", guild_id));
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth())
            .query(&[
                ("action_type", action.discord_code().to_string()),
                ("limit", limit.clamp(1, 100).to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!(
                "Discord audit log request failed ({}): {}",
                status, body
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl AuditLogReader for DiscordClient {
    async fn query(
        &self,
        guild_id: GuildId,
        actions: &[AuditAction],
        target: UserId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        // The endpoint filters by a single action type per request
        let mut entries = Vec::new();
        for action in actions {
            let log = self.fetch_audit_log(guild_id, *action, limit).await?;
            entries.extend(log.into_entries(target, since));
        }

        entries.sort_by(|a, b| b.entry_id.cmp(&a.entry_id));
        entries.truncate(limit);
        Ok(entries)
    }
}

#[async_trait]
impl NotificationSink for DiscordClient {
    async fn post(&self, channel_id: u64, text: &str) -> Result<()> {
        let url = self.url(&format!("/channels/{}/messages", channel_id));
        let payload = serde_json::json!({
            "content": text,
            "allowed_mentions": { "parse": [] },
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!(
                "Discord message post failed ({}): {}",
                status, body
            )));
        }

        tracing::debug!(channel = channel_id, "Notice posted");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditLogResponse {
    #[serde(default)]
    pub audit_log_entries: Vec<RawAuditEntry>,
}

/// Audit log entry as returned by the API. Snowflakes arrive as strings.
#[derive(Debug, Deserialize)]
pub struct RawAuditEntry {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    pub action_type: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RawAuditEntry {
    fn parse(&self) -> Option<AuditEntry> {
        let entry_id: u64 = self.id.parse().ok()?;
        Some(AuditEntry {
            entry_id,
            actor: self.user_id.as_deref()?.parse().ok()?,
            target: self.target_id.as_deref()?.parse().ok()?,
            action: AuditAction::from_discord_code(self.action_type)?,
            reason: self.reason.clone(),
            occurred_at: snowflake_timestamp(entry_id)?,
        })
    }
}

impl AuditLogResponse {
    /// Entries about `target` logged at or after `since`
    pub fn into_entries(self, target: UserId, since: DateTime<Utc>) -> Vec<AuditEntry> {
        self.audit_log_entries
            .iter()
            .filter_map(|raw| {
                let parsed = raw.parse();
                if parsed.is_none() {
                    tracing::debug!(id = %raw.id, "Skipping unusable audit log entry");
                }
                parsed
            })
            .filter(|e| e.target == target && e.occurred_at >= since)
            .collect()
    }
}
