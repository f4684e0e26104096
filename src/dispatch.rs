//! Signal dispatcher
//!
//! Every inbound signal runs in its own task. Ordering between signals for
//! the same user or guild member comes from the exclusion tokens inside the
//! store and the attributor, not from the dispatcher, so a slow audit poll
//! for one member never delays a gallery request for another.
//!
//! `SignalFeed` sits in front of a handle for serialized input and keeps
//! records for one key in feed order without blocking the rest.

use crate::attribution::{Classification, EventAttributor, GuildId, MembershipEvent, SignalKind};
use crate::cpuinfo::{CpuInfo, CpuInfoBundle, CpuInfoRegistry};
use crate::error::{Error, Result};
use crate::gallery::{
    Artifact, ArtifactStore, EvictionOutcome, EvictionToken, PendingEviction, Selector,
    StoreOutcome, UserId,
};
use crate::notify::NotificationSink;
use crate::players::{PlayerRegistry, PlayerStats};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

// =============================================================================
// Signals
// =============================================================================

/// One inbound signal. Requests carry the channel their answer goes back on.
#[derive(Debug)]
pub enum BotEvent {
    Membership {
        event: MembershipEvent,
        reply: Option<oneshot::Sender<Option<Classification>>>,
    },
    Store {
        user_id: UserId,
        name: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<StoreOutcome>>,
    },
    Confirm {
        token: EvictionToken,
        reply: oneshot::Sender<Result<EvictionOutcome>>,
    },
    Cancel {
        token: EvictionToken,
        reply: oneshot::Sender<Result<PendingEviction>>,
    },
    Delete {
        user_id: UserId,
        selector: Selector,
        reply: oneshot::Sender<Result<Vec<Artifact>>>,
    },
    List {
        user_id: UserId,
        reply: oneshot::Sender<Vec<Artifact>>,
    },
    Join {
        user_id: UserId,
        reply: oneshot::Sender<PlayerStats>,
    },
    Login {
        user_id: UserId,
        reply: oneshot::Sender<Result<PlayerStats>>,
    },
    Information {
        user_id: UserId,
        reply: oneshot::Sender<Result<PlayerStats>>,
    },
    CpuInfo {
        owner: UserId,
        name: String,
        structure: Bytes,
        instruction: Bytes,
        reply: oneshot::Sender<Result<CpuInfo>>,
    },
    GetCpuInfo {
        name: String,
        reply: oneshot::Sender<Result<CpuInfoBundle>>,
    },
}

impl BotEvent {
    fn label(&self) -> &'static str {
        match self {
            BotEvent::Membership { .. } => "membership",
            BotEvent::Store { .. } => "store",
            BotEvent::Confirm { .. } => "confirm",
            BotEvent::Cancel { .. } => "cancel",
            BotEvent::Delete { .. } => "delete",
            BotEvent::List { .. } => "list",
            BotEvent::Join { .. } => "join",
            BotEvent::Login { .. } => "login",
            BotEvent::Information { .. } => "information",
            BotEvent::CpuInfo { .. } => "cpuinfo",
            BotEvent::GetCpuInfo { .. } => "getcpuinfo",
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct Dispatcher {
    store: Arc<ArtifactStore>,
    attributor: Arc<EventAttributor>,
    players: Arc<PlayerRegistry>,
    cpuinfo: Arc<CpuInfoRegistry>,
    sink: Arc<dyn NotificationSink>,
    notify_channel: Option<u64>,
    allowed_guilds: Vec<GuildId>,
    sweep_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ArtifactStore>,
        attributor: Arc<EventAttributor>,
        players: Arc<PlayerRegistry>,
        cpuinfo: Arc<CpuInfoRegistry>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            attributor,
            players,
            cpuinfo,
            sink,
            notify_channel: None,
            allowed_guilds: Vec::new(),
            sweep_interval: Duration::from_secs(30),
        }
    }

    /// Channel that receives departure notices (None = notices are not posted)
    pub fn with_notify_channel(mut self, channel_id: Option<u64>) -> Self {
        self.notify_channel = channel_id;
        self
    }

    /// Guilds whose membership signals are handled (empty = all)
    pub fn with_allowed_guilds(mut self, guilds: Vec<GuildId>) -> Self {
        self.allowed_guilds = guilds;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Spawn the dispatch loop. It runs until every handle is dropped, then
    /// waits for in-flight handlers before returning.
    pub fn start(self, buffer: usize) -> (DispatcherHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let dispatcher = Arc::new(self);
        let task = tokio::spawn(dispatcher.run(rx));
        (DispatcherHandle { tx }, task)
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BotEvent>) {
        let mut sweep = tokio::time::interval(self.sweep_interval.max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        tracing::info!("Dispatcher started");

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(event) = received else { break };
                    let label = event.label();
                    let this = self.clone();
                    tasks.spawn(async move {
                        this.handle(event).await;
                        label
                    });
                }
                _ = sweep.tick() => {
                    self.store.sweep_expired().await;
                }
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!("Signal handler aborted: {}", e);
                    }
                }
            }
        }

        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                tracing::error!("Signal handler aborted: {}", e);
            }
        }

        tracing::info!("Dispatcher stopped");
    }

    async fn handle(&self, event: BotEvent) {
        match event {
            BotEvent::Membership { event, reply } => {
                let classification = self.on_membership(&event).await;
                if let Some(reply) = reply {
                    let _ = reply.send(classification);
                }
            }
            BotEvent::Store {
                user_id,
                name,
                payload,
                reply,
            } => {
                let result = self.store.store(user_id, &name, payload).await;
                log_failure("store", user_id, &result);
                let _ = reply.send(result);
            }
            BotEvent::Confirm { token, reply } => {
                let result = self.store.confirm_eviction(&token).await;
                if let Err(e) = &result {
                    tracing::warn!(token = %token, "confirm failed: {}", e);
                }
                let _ = reply.send(result);
            }
            BotEvent::Cancel { token, reply } => {
                let result = self.store.cancel_eviction(&token).await;
                if let Err(e) = &result {
                    tracing::warn!(token = %token, "cancel failed: {}", e);
                }
                let _ = reply.send(result);
            }
            BotEvent::Delete {
                user_id,
                selector,
                reply,
            } => {
                let result = self.store.delete(user_id, &selector).await;
                log_failure("delete", user_id, &result);
                let _ = reply.send(result);
            }
            BotEvent::List { user_id, reply } => {
                let _ = reply.send(self.store.list(user_id).await);
            }
            BotEvent::Join { user_id, reply } => {
                let _ = reply.send(self.players.join(user_id).await);
            }
            BotEvent::Login { user_id, reply } => {
                let result = self.players.login(user_id).await;
                log_failure("login", user_id, &result);
                let _ = reply.send(result);
            }
            BotEvent::Information { user_id, reply } => {
                let _ = reply.send(self.players.information(user_id).await);
            }
            BotEvent::CpuInfo {
                owner,
                name,
                structure,
                instruction,
                reply,
            } => {
                let result = self.cpuinfo.save(owner, &name, structure, instruction).await;
                log_failure("cpuinfo", owner, &result);
                let _ = reply.send(result);
            }
            BotEvent::GetCpuInfo { name, reply } => {
                let result = self.cpuinfo.get(&name).await;
                if let Err(e) = &result {
                    tracing::debug!(name = %name, "getcpuinfo rejected: {}", e);
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn on_membership(&self, event: &MembershipEvent) -> Option<Classification> {
        if !self.allowed_guilds.is_empty() && !self.allowed_guilds.contains(&event.guild_id) {
            tracing::debug!(guild = event.guild_id, "Ignoring signal from guild not on allow list");
            return None;
        }

        let classification = self.attributor.attribute(event).await?;

        if let Some(channel) = self.notify_channel {
            let text = classification.notice(event.user_id);
            if let Err(e) = self.sink.post(channel, &text).await {
                tracing::warn!(channel, user = event.user_id, "Failed to post departure notice: {}", e);
            }
        }

        Some(classification)
    }
}

fn log_failure<T>(op: &str, user_id: UserId, result: &Result<T>) {
    match result {
        // Expected outcomes of user requests
        Err(
            e @ (Error::NotFound(_)
            | Error::ConflictInProgress(_)
            | Error::InvalidName(_)
            | Error::DuplicateName(_)
            | Error::NotRegistered(_)),
        ) => tracing::debug!(user = user_id, "{} rejected: {}", op, e),
        Err(e) => tracing::warn!(user = user_id, "{} failed: {}", op, e),
        Ok(_) => {}
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable front end for submitting signals
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<BotEvent>,
}

impl DispatcherHandle {
    async fn send(&self, event: BotEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::Internal("dispatcher is not running".to_string()))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> BotEvent) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await
            .map_err(|_| Error::Internal("signal handler dropped its reply".to_string()))
    }

    /// Fire-and-forget membership signal
    pub async fn signal(&self, event: MembershipEvent) -> Result<()> {
        self.send(BotEvent::Membership { event, reply: None }).await
    }

    /// Membership signal, waiting for its classification (None = suppressed
    /// or ignored)
    pub async fn attribute(&self, event: MembershipEvent) -> Result<Option<Classification>> {
        self.request(|reply| BotEvent::Membership {
            event,
            reply: Some(reply),
        })
        .await
    }

    pub async fn store(
        &self,
        user_id: UserId,
        name: impl Into<String>,
        payload: Bytes,
    ) -> Result<StoreOutcome> {
        let name = name.into();
        self.request(|reply| BotEvent::Store {
            user_id,
            name,
            payload,
            reply,
        })
        .await?
    }

    pub async fn confirm(&self, token: EvictionToken) -> Result<EvictionOutcome> {
        self.request(|reply| BotEvent::Confirm { token, reply }).await?
    }

    pub async fn cancel(&self, token: EvictionToken) -> Result<PendingEviction> {
        self.request(|reply| BotEvent::Cancel { token, reply }).await?
    }

    pub async fn delete(&self, user_id: UserId, selector: Selector) -> Result<Vec<Artifact>> {
        self.request(|reply| BotEvent::Delete {
            user_id,
            selector,
            reply,
        })
        .await?
    }

    pub async fn list(&self, user_id: UserId) -> Result<Vec<Artifact>> {
        self.request(|reply| BotEvent::List { user_id, reply }).await
    }

    pub async fn join(&self, user_id: UserId) -> Result<PlayerStats> {
        self.request(|reply| BotEvent::Join { user_id, reply }).await
    }

    pub async fn login(&self, user_id: UserId) -> Result<PlayerStats> {
        self.request(|reply| BotEvent::Login { user_id, reply }).await?
    }

    pub async fn information(&self, user_id: UserId) -> Result<PlayerStats> {
        self.request(|reply| BotEvent::Information { user_id, reply })
            .await?
    }

    pub async fn cpuinfo(
        &self,
        owner: UserId,
        name: impl Into<String>,
        structure: Bytes,
        instruction: Bytes,
    ) -> Result<CpuInfo> {
        let name = name.into();
        self.request(|reply| BotEvent::CpuInfo {
            owner,
            name,
            structure,
            instruction,
            reply,
        })
        .await?
    }

    pub async fn get_cpuinfo(&self, name: impl Into<String>) -> Result<CpuInfoBundle> {
        let name = name.into();
        self.request(|reply| BotEvent::GetCpuInfo { name, reply }).await?
    }

    /// Run a serialized signal and describe its outcome in one line
    pub async fn submit(&self, record: SignalRecord) -> Result<String> {
        match record {
            SignalRecord::Removed {
                user_id,
                guild_id,
                observed_at,
            } => self.submit_membership(user_id, guild_id, observed_at, SignalKind::Removed).await,
            SignalRecord::Banned {
                user_id,
                guild_id,
                observed_at,
            } => self.submit_membership(user_id, guild_id, observed_at, SignalKind::Banned).await,
            SignalRecord::Store {
                user_id,
                name,
                text,
                path,
            } => {
                let payload = match (path, text) {
                    (Some(path), _) => Bytes::from(tokio::fs::read(&path).await?),
                    (None, Some(text)) => Bytes::from(text),
                    (None, None) => Bytes::new(),
                };
                Ok(match self.store(user_id, name, payload).await? {
                    StoreOutcome::Stored(artifact) => format!("stored {}", artifact.name),
                    StoreOutcome::PendingConfirmation {
                        token, candidate, ..
                    } => format!(
                        "gallery full: confirm {} to replace {}",
                        token, candidate.name
                    ),
                })
            }
            SignalRecord::Confirm { token } => {
                let outcome = self.confirm(token).await?;
                Ok(format!(
                    "replaced {} with {}",
                    outcome.evicted.name, outcome.stored.name
                ))
            }
            SignalRecord::Cancel { token } => {
                let cancelled = self.cancel(token).await?;
                Ok(format!("kept {}", cancelled.candidate.name))
            }
            SignalRecord::Delete { user_id, selector } => {
                let removed = self.delete(user_id, selector).await?;
                Ok(format!("deleted {}", names(&removed)))
            }
            SignalRecord::List { user_id } => {
                let artifacts = self.list(user_id).await?;
                if artifacts.is_empty() {
                    return Ok("gallery empty".to_string());
                }
                Ok(artifacts
                    .iter()
                    .enumerate()
                    .map(|(i, a)| format!("{}. {}", i + 1, a.name))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            SignalRecord::Join { user_id } => {
                self.join(user_id).await?;
                Ok(format!("<@{}> joined", user_id))
            }
            SignalRecord::Login { user_id } => {
                let stats = self.login(user_id).await?;
                Ok(format!("<@{}> login days: {}", user_id, stats.login_days))
            }
            SignalRecord::Information { user_id } => {
                let stats = self.information(user_id).await?;
                Ok(format!(
                    "login days: {}, level: {}",
                    stats.login_days, stats.level
                ))
            }
            SignalRecord::CpuInfo {
                owner,
                name,
                structure_path,
                instruction_path,
            } => {
                let name = design_name(name.as_deref(), &structure_path);
                let structure = Bytes::from(tokio::fs::read(&structure_path).await?);
                let instruction = Bytes::from(tokio::fs::read(&instruction_path).await?);
                let info = self.cpuinfo(owner, name, structure, instruction).await?;
                Ok(format!("saved design {}", info.name))
            }
            SignalRecord::GetCpuInfo { name } => {
                let bundle = self.get_cpuinfo(name).await?;
                Ok(format!(
                    "design {} by <@{}>: structure {} bytes, instruction {} bytes, gallery image {}",
                    bundle.info.name,
                    bundle.info.owner,
                    bundle.structure.len(),
                    bundle.instruction.len(),
                    if bundle.gallery.is_some() { "attached" } else { "none" }
                ))
            }
        }
    }

    async fn submit_membership(
        &self,
        user_id: UserId,
        guild_id: GuildId,
        observed_at: DateTime<Utc>,
        kind: SignalKind,
    ) -> Result<String> {
        let event = MembershipEvent {
            user_id,
            guild_id,
            observed_at,
            kind,
        };
        Ok(match self.attribute(event).await? {
            Some(classification) => classification.notice(user_id),
            None => format!("<@{}> {} signal suppressed", user_id, kind),
        })
    }
}

/// Explicit name, else the structure file's name up to its first `.`
fn design_name(name: Option<&str>, structure_path: &std::path::Path) -> String {
    match name {
        Some(name) => name.to_string(),
        None => structure_path
            .file_name()
            .and_then(|f| f.to_str())
            .and_then(|f| f.split('.').next())
            .unwrap_or_default()
            .to_string(),
    }
}

fn names(artifacts: &[Artifact]) -> String {
    if artifacts.is_empty() {
        return "nothing".to_string();
    }
    artifacts
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Serialized signals
// =============================================================================

/// Signal as read from an NDJSON feed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalRecord {
    Removed {
        user_id: UserId,
        guild_id: GuildId,
        #[serde(default = "Utc::now")]
        observed_at: DateTime<Utc>,
    },
    Banned {
        user_id: UserId,
        guild_id: GuildId,
        #[serde(default = "Utc::now")]
        observed_at: DateTime<Utc>,
    },
    Store {
        user_id: UserId,
        name: String,
        /// Inline payload
        #[serde(default)]
        text: Option<String>,
        /// File to read the payload from
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Confirm {
        token: EvictionToken,
    },
    Cancel {
        token: EvictionToken,
    },
    Delete {
        user_id: UserId,
        selector: Selector,
    },
    List {
        user_id: UserId,
    },
    Join {
        user_id: UserId,
    },
    Login {
        user_id: UserId,
    },
    Information {
        user_id: UserId,
    },
    CpuInfo {
        owner: UserId,
        /// Defaults to the structure file's name
        #[serde(default)]
        name: Option<String>,
        structure_path: PathBuf,
        instruction_path: PathBuf,
    },
    GetCpuInfo {
        name: String,
    },
}

impl SignalRecord {
    /// Records sharing a key are answered in feed order
    pub fn sequence_key(&self) -> SequenceKey {
        match self {
            SignalRecord::Removed {
                user_id, guild_id, ..
            }
            | SignalRecord::Banned {
                user_id, guild_id, ..
            } => SequenceKey::Member(*guild_id, *user_id),
            SignalRecord::Confirm { token } | SignalRecord::Cancel { token } => {
                SequenceKey::Token(token.clone())
            }
            SignalRecord::Store { user_id, .. }
            | SignalRecord::Delete { user_id, .. }
            | SignalRecord::List { user_id }
            | SignalRecord::Join { user_id }
            | SignalRecord::Login { user_id }
            | SignalRecord::Information { user_id } => SequenceKey::User(*user_id),
            SignalRecord::CpuInfo {
                name,
                structure_path,
                ..
            } => SequenceKey::Design(design_key(&design_name(name.as_deref(), structure_path))),
            SignalRecord::GetCpuInfo { name } => SequenceKey::Design(design_key(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SequenceKey {
    User(UserId),
    Member(GuildId, UserId),
    Token(EvictionToken),
    Design(String),
}

fn design_key(name: &str) -> String {
    name.trim().replace(' ', "_")
}

// =============================================================================
// Feed
// =============================================================================

/// Submits serialized signals concurrently. Records with the same
/// `sequence_key` run one after another in feed order; everything else
/// overlaps, so a slow audit poll never holds up another user's request.
pub struct SignalFeed {
    handle: DispatcherHandle,
    /// Completion of the last record started for each key
    tails: HashMap<SequenceKey, oneshot::Receiver<()>>,
    inflight: JoinSet<Result<String>>,
}

impl SignalFeed {
    pub fn new(handle: DispatcherHandle) -> Self {
        Self {
            handle,
            tails: HashMap::new(),
            inflight: JoinSet::new(),
        }
    }

    /// Start a record without waiting for its reply
    pub fn push(&mut self, record: SignalRecord) {
        self.tails
            .retain(|_, tail| matches!(tail.try_recv(), Err(TryRecvError::Empty)));

        let key = record.sequence_key();
        let previous = self.tails.remove(&key);
        let (done_tx, done_rx) = oneshot::channel::<()>();
        self.tails.insert(key, done_rx);

        let handle = self.handle.clone();
        self.inflight.spawn(async move {
            // Closed also means the predecessor is gone
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let reply = handle.submit(record).await;
            let _ = done_tx.send(());
            reply
        });
    }

    /// Records started but not yet answered
    pub fn pending(&self) -> usize {
        self.inflight.len()
    }

    /// The next reply to complete, or `None` when nothing is in flight
    pub async fn next_reply(&mut self) -> Option<Result<String>> {
        let finished = self.inflight.join_next().await?;
        Some(finished.unwrap_or_else(|e| Err(Error::Internal(format!("signal task failed: {}", e)))))
    }
}
