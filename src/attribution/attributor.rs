//! Departure classification
//!
//! Removal signals arrive before the audit trail has caught up, so the
//! attributor polls the trail with bounded backoff until a matching entry
//! appears or the wait budget runs out. Signals for one guild member are
//! handled one at a time, which lets a ban suppress the removal signal the
//! same ban also produces.

use super::audit::AuditLogReader;
use super::types::{AuditAction, AuditEntry, Classification, GuildId, MembershipEvent, SignalKind};
use crate::config::AttributionConfig;
use crate::error::{Error, Result};
use crate::gallery::UserId;
use crate::locks::KeyedLocks;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

type MemberKey = (GuildId, UserId);

struct BanRecord {
    observed_at: DateTime<Utc>,
    recorded: tokio::time::Instant,
}

pub struct EventAttributor {
    reader: Arc<dyn AuditLogReader>,
    config: AttributionConfig,
    locks: KeyedLocks<MemberKey>,
    /// When each member was last reported as banned
    recent_bans: Mutex<HashMap<MemberKey, BanRecord>>,
}

impl EventAttributor {
    pub fn new(reader: Arc<dyn AuditLogReader>, config: AttributionConfig) -> Self {
        Self {
            reader,
            config,
            locks: KeyedLocks::new(),
            recent_bans: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }

    /// Forget every reported ban
    pub async fn reset(&self) {
        self.recent_bans.lock().await.clear();
    }

    /// Classify a signal, or return `None` when an earlier ban already
    /// explains it
    pub async fn attribute(&self, event: &MembershipEvent) -> Option<Classification> {
        let key = (event.guild_id, event.user_id);
        let _guard = self.locks.lock(&key).await;

        if self.already_reported(key, event.observed_at).await {
            tracing::info!(
                guild = event.guild_id,
                user = event.user_id,
                kind = %event.kind,
                "Signal suppressed by recent ban"
            );
            return None;
        }

        let classification = self
            .classify(event.guild_id, event.user_id, event.kind, event.observed_at)
            .await;

        if classification.is_ban() {
            self.recent_bans.lock().await.insert(
                key,
                BanRecord {
                    observed_at: event.observed_at,
                    recorded: tokio::time::Instant::now(),
                },
            );
        }

        Some(classification)
    }

    /// Classify a signal without suppression. Audit trail failures degrade
    /// to the unattributed result.
    pub async fn classify(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        kind: SignalKind,
        observed_at: DateTime<Utc>,
    ) -> Classification {
        let classification = match self.find_entry(guild_id, user_id, kind, observed_at).await {
            Ok(Some(entry)) => Classification::from_entry(&entry),
            Ok(None) => Classification::unattributed(kind, observed_at),
            Err(e) => {
                tracing::warn!(
                    guild = guild_id,
                    user = user_id,
                    kind = %kind,
                    "Audit trail unavailable, reporting unattributed: {}",
                    e
                );
                Classification::unattributed(kind, observed_at)
            }
        };

        tracing::info!(
            guild = guild_id,
            user = user_id,
            kind = %kind,
            classification = ?classification,
            "Departure classified"
        );
        classification
    }

    /// Poll the audit trail for the entry that best explains a signal.
    ///
    /// Makes one query plus up to `max_retries` more, sleeping per the
    /// backoff schedule between them. The whole poll, queries included, ends
    /// within `max_total_wait`: each query's timeout is cut to what is left
    /// of it and no retry starts once it is spent. Returns
    /// `AuditQueryTimeout` only if no query succeeded.
    pub async fn find_entry(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        kind: SignalKind,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<AuditEntry>> {
        let window = self.config.lookback_window();
        let since = observed_at - to_chrono(window);
        let actions = kind.qualifying_actions();
        let budget = self.config.max_total_wait();
        let started = tokio::time::Instant::now();

        let mut attempts = 0u32;
        let mut answered = false;

        for retry in 0..=self.config.max_retries {
            if retry > 0 {
                let remaining = budget.saturating_sub(started.elapsed());
                let delay = self.config.backoff_for(retry);
                if delay >= remaining {
                    tracing::debug!(guild = guild_id, user = user_id, attempts, "Audit wait budget spent");
                    break;
                }
                tokio::time::sleep(delay).await;
            }

            let remaining = budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            let query = self
                .reader
                .query(guild_id, actions, user_id, since, self.config.query_limit);
            match tokio::time::timeout(self.config.query_timeout().min(remaining), query).await {
                Ok(Ok(entries)) => {
                    answered = true;
                    if let Some(entry) = best_match(&entries, user_id, actions, observed_at, window) {
                        tracing::debug!(
                            guild = guild_id,
                            user = user_id,
                            entry = entry.entry_id,
                            attempt = attempts,
                            "Audit entry matched"
                        );
                        return Ok(Some(entry));
                    }
                    tracing::debug!(
                        guild = guild_id,
                        user = user_id,
                        attempt = attempts,
                        "No audit entry yet"
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!(guild = guild_id, attempt = attempts, "Audit query failed: {}", e);
                }
                Err(_) => {
                    tracing::warn!(guild = guild_id, attempt = attempts, "Audit query timed out");
                }
            }
        }

        if answered {
            Ok(None)
        } else {
            Err(Error::AuditQueryTimeout { attempts })
        }
    }

    /// Whether a ban for this member was reported within the window of
    /// `observed_at`. Other members' records are only aged out by how long
    /// they have been held.
    async fn already_reported(&self, key: MemberKey, observed_at: DateTime<Utc>) -> bool {
        let window = to_chrono(self.config.lookback_window());
        let retention = self.config.lookback_window() + self.config.max_total_wait();
        let mut bans = self.recent_bans.lock().await;
        bans.retain(|_, record| record.recorded.elapsed() <= retention);

        match bans.get(&key) {
            Some(record) if (observed_at - record.observed_at).abs() <= window => true,
            Some(_) => {
                bans.remove(&key);
                false
            }
            None => false,
        }
    }
}

/// Pick the entry closest in time to the signal, preferring the newer entry
/// on a tie. Entries outside the window, for other targets, or with other
/// actions never match.
pub fn best_match(
    entries: &[AuditEntry],
    target: UserId,
    actions: &[AuditAction],
    observed_at: DateTime<Utc>,
    window: Duration,
) -> Option<AuditEntry> {
    let window = to_chrono(window);
    entries
        .iter()
        .filter(|e| e.target == target && actions.contains(&e.action))
        .map(|e| ((e.occurred_at - observed_at).abs(), e))
        .filter(|(delta, _)| *delta <= window)
        .min_by(|(da, a), (db, b)| da.cmp(db).then_with(|| b.entry_id.cmp(&a.entry_id)))
        .map(|(_, e)| e.clone())
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
