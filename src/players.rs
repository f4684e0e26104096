//! Player registry for the login-streak game

use crate::error::{Error, Result};
use crate::gallery::UserId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Per-player counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub login_days: u32,
    pub level: u32,
}

/// Process-local registry of joined players
#[derive(Default)]
pub struct PlayerRegistry {
    players: RwLock<HashMap<UserId, PlayerStats>>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an empty registry
    pub async fn init(&self) {
        self.reset().await;
    }

    pub async fn reset(&self) {
        self.players.write().await.clear();
    }

    /// Register a player, restarting their stats if already present
    pub async fn join(&self, user_id: UserId) -> PlayerStats {
        let stats = PlayerStats::default();
        let previous = self.players.write().await.insert(user_id, stats);
        tracing::info!(user = user_id, rejoined = previous.is_some(), "Player joined");
        stats
    }

    /// Count one login
    pub async fn login(&self, user_id: UserId) -> Result<PlayerStats> {
        let mut players = self.players.write().await;
        let stats = players
            .get_mut(&user_id)
            .ok_or(Error::NotRegistered(user_id))?;
        stats.login_days = stats.login_days.saturating_add(1);
        tracing::debug!(user = user_id, login_days = stats.login_days, "Player logged in");
        Ok(*stats)
    }

    pub async fn information(&self, user_id: UserId) -> Result<PlayerStats> {
        self.players
            .read()
            .await
            .get(&user_id)
            .copied()
            .ok_or(Error::NotRegistered(user_id))
    }

    pub async fn len(&self) -> usize {
        self.players.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.players.read().await.is_empty()
    }
}
