//! Arena of open eviction proposals
//!
//! Each record is indexed by its generated token and by its owner, so a user
//! holds at most one open proposal. Expiry is checked lazily on every access
//! and eagerly by `sweep`. Tokens of expired proposals are remembered for a
//! while so late answers still read as expired rather than unknown.

use super::types::{EvictionToken, PendingEviction, UserId};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// How long an expired token is still recognised
const TOMBSTONE_RETENTION_MINS: i64 = 60;

/// Upper bound on remembered expired tokens
const MAX_TOMBSTONES: usize = 4096;

#[derive(Default)]
pub struct PendingArena {
    by_token: HashMap<EvictionToken, PendingEviction>,
    by_user: HashMap<UserId, EvictionToken>,
    /// Expired tokens and when they expired
    tombstones: HashMap<EvictionToken, DateTime<Utc>>,
}

impl PendingArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a proposal. Fails if the owner already has a live one; an
    /// expired one is dropped first.
    pub fn open(&mut self, pending: PendingEviction, now: DateTime<Utc>) -> Result<()> {
        if self.live_for_user(pending.user_id, now).is_some() {
            return Err(Error::ConflictInProgress(pending.user_id));
        }
        self.by_user.insert(pending.user_id, pending.token.clone());
        self.by_token.insert(pending.token.clone(), pending);
        Ok(())
    }

    /// The owner's live proposal, dropping it if it has expired
    pub fn live_for_user(&mut self, user_id: UserId, now: DateTime<Utc>) -> Option<&PendingEviction> {
        let token = self.by_user.get(&user_id)?.clone();
        let expired = self
            .by_token
            .get(&token)
            .map(|p| p.is_expired_at(now))
            .unwrap_or(true);
        if expired {
            self.expire(&token, now);
            return None;
        }
        self.by_token.get(&token)
    }

    /// Owner of a live or not yet swept token without consuming it. Tokens
    /// that already expired and were dropped fail with `TokenExpired`.
    pub fn owner(&self, token: &EvictionToken) -> Result<UserId> {
        if let Some(pending) = self.by_token.get(token) {
            return Ok(pending.user_id);
        }
        Err(self.missing(token))
    }

    /// Consume a proposal by token
    pub fn take(&mut self, token: &EvictionToken, now: DateTime<Utc>) -> Result<PendingEviction> {
        let expired = match self.by_token.get(token) {
            Some(pending) => pending.is_expired_at(now),
            None => return Err(self.missing(token)),
        };
        if expired {
            self.expire(token, now);
            return Err(Error::TokenExpired(token.to_string()));
        }
        self.remove(token)
            .ok_or_else(|| Error::TokenUnknown(token.to_string()))
    }

    /// Whether `token` belonged to a proposal that expired
    pub fn is_tombstoned(&self, token: &EvictionToken) -> bool {
        self.tombstones.contains_key(token)
    }

    /// Put back a proposal taken by `take`
    pub fn restore(&mut self, pending: PendingEviction) {
        self.by_user.insert(pending.user_id, pending.token.clone());
        self.by_token.insert(pending.token.clone(), pending);
    }

    /// Drop whatever proposal the owner has, live or expired
    pub fn discard_for_user(&mut self, user_id: UserId) -> Option<PendingEviction> {
        let token = self.by_user.get(&user_id)?.clone();
        self.remove(&token)
    }

    /// Drop every expired proposal
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<PendingEviction> {
        let expired: Vec<EvictionToken> = self
            .by_token
            .values()
            .filter(|p| p.is_expired_at(now))
            .map(|p| p.token.clone())
            .collect();
        let swept = expired.iter().filter_map(|t| self.expire(t, now)).collect();
        self.prune_tombstones(now);
        swept
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_token.clear();
        self.by_user.clear();
        self.tombstones.clear();
    }

    fn missing(&self, token: &EvictionToken) -> Error {
        if self.is_tombstoned(token) {
            Error::TokenExpired(token.to_string())
        } else {
            Error::TokenUnknown(token.to_string())
        }
    }

    /// Drop an expired proposal, remembering its token
    fn expire(&mut self, token: &EvictionToken, now: DateTime<Utc>) -> Option<PendingEviction> {
        let pending = self.remove(token)?;
        if self.tombstones.len() >= MAX_TOMBSTONES {
            self.prune_tombstones(now);
        }
        if self.tombstones.len() >= MAX_TOMBSTONES {
            // Still full: forget the oldest
            if let Some(oldest) = self
                .tombstones
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(t, _)| t.clone())
            {
                self.tombstones.remove(&oldest);
            }
        }
        self.tombstones.insert(token.clone(), pending.expires_at);
        Some(pending)
    }

    fn prune_tombstones(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::minutes(TOMBSTONE_RETENTION_MINS);
        self.tombstones.retain(|_, expired_at| *expired_at > cutoff);
    }

    fn remove(&mut self, token: &EvictionToken) -> Option<PendingEviction> {
        let pending = self.by_token.remove(token)?;
        if self.by_user.get(&pending.user_id) == Some(token) {
            self.by_user.remove(&pending.user_id);
        }
        Some(pending)
    }
}
