//! Attribution: explain why a member left a guild
//!
//! Matches gateway removal signals against the moderation audit trail and
//! classifies each departure as voluntary, a kick, or a ban.

pub mod attributor;
pub mod audit;
pub mod types;

pub use attributor::{best_match, EventAttributor};
pub use audit::{AuditLogReader, GuildAuditRecord, MemoryAuditLog};
pub use types::{AuditAction, AuditEntry, Classification, GuildId, MembershipEvent, SignalKind};
