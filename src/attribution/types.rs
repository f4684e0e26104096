//! Membership signal and audit trail types

use crate::gallery::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discord guild snowflake
pub type GuildId = u64;

/// What the gateway reported about a departing member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Member left the guild, by choice or by kick
    Removed,
    /// Member was banned
    Banned,
}

impl SignalKind {
    /// Audit actions that can explain this signal. A ban also removes the
    /// member, so removals accept both.
    pub fn qualifying_actions(&self) -> &'static [AuditAction] {
        match self {
            SignalKind::Removed => &[AuditAction::Kick, AuditAction::Ban],
            SignalKind::Banned => &[AuditAction::Ban],
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Removed => write!(f, "removed"),
            SignalKind::Banned => write!(f, "banned"),
        }
    }
}

/// One removal signal, consumed once by the attributor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub user_id: UserId,
    pub guild_id: GuildId,
    pub observed_at: DateTime<Utc>,
    pub kind: SignalKind,
}

/// Moderation action recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Kick,
    Ban,
}

impl AuditAction {
    /// Discord audit log action type code
    pub fn discord_code(&self) -> u32 {
        match self {
            AuditAction::Kick => 20,
            AuditAction::Ban => 22,
        }
    }

    pub fn from_discord_code(code: u32) -> Option<Self> {
        match code {
            20 => Some(AuditAction::Kick),
            22 => Some(AuditAction::Ban),
            _ => None,
        }
    }
}

/// An externally logged moderation action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: u64,
    pub actor: UserId,
    pub target: UserId,
    pub action: AuditAction,
    #[serde(default)]
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Why a member left
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    Voluntary,
    Kicked {
        actor: UserId,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    Banned {
        actor: UserId,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    BannedUnknownActor {
        occurred_at: DateTime<Utc>,
    },
}

impl Classification {
    pub fn from_entry(entry: &AuditEntry) -> Self {
        match entry.action {
            AuditAction::Kick => Classification::Kicked {
                actor: entry.actor,
                reason: entry.reason.clone(),
                occurred_at: entry.occurred_at,
            },
            AuditAction::Ban => Classification::Banned {
                actor: entry.actor,
                reason: entry.reason.clone(),
                occurred_at: entry.occurred_at,
            },
        }
    }

    /// Result when the audit trail has nothing for a signal
    pub fn unattributed(kind: SignalKind, observed_at: DateTime<Utc>) -> Self {
        match kind {
            SignalKind::Removed => Classification::Voluntary,
            SignalKind::Banned => Classification::BannedUnknownActor {
                occurred_at: observed_at,
            },
        }
    }

    pub fn is_ban(&self) -> bool {
        matches!(
            self,
            Classification::Banned { .. } | Classification::BannedUnknownActor { .. }
        )
    }

    /// Human-readable notice for the departure channel
    pub fn notice(&self, user_id: UserId) -> String {
        fn with_reason(base: String, reason: &Option<String>) -> String {
            match reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
                Some(reason) => format!("{} Reason: {}", base, reason),
                None => base,
            }
        }

        match self {
            Classification::Voluntary => format!("<@{}> left the server.", user_id),
            Classification::Kicked { actor, reason, .. } => {
                with_reason(format!("<@{}> was kicked by <@{}>.", user_id, actor), reason)
            }
            Classification::Banned { actor, reason, .. } => {
                with_reason(format!("<@{}> was banned by <@{}>.", user_id, actor), reason)
            }
            Classification::BannedUnknownActor { .. } => format!("<@{}> was banned.", user_id),
        }
    }
}
