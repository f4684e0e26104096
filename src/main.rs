//! Gallerybot - per-user image galleries and departure notices for Discord
//!
//! The binary feeds signals through the dispatcher and inspects stored
//! galleries. Gateway connectivity is provided by the host process, which
//! writes signals as NDJSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gallerybot::{
    attribution::{AuditLogReader, EventAttributor, MemoryAuditLog},
    config::GalleryBotConfig,
    cpuinfo::CpuInfoRegistry,
    discord::DiscordClient,
    dispatch::{Dispatcher, SignalFeed, SignalRecord},
    gallery::{ArtifactStore, FsBlobStore},
    notify::{LogSink, NotificationSink},
    players::PlayerRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gallerybot")]
#[command(author = "Gallerybot Team")]
#[command(version)]
#[command(about = "Per-user image galleries and departure notices for Discord")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "GALLERYBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process NDJSON signals and print each reply as it completes
    Run {
        /// Signal file (defaults to stdin)
        #[arg(short, long)]
        events: Option<PathBuf>,

        /// Audit log fixture (JSON array) used instead of the Discord API
        #[arg(short, long)]
        audit: Option<PathBuf>,
    },

    /// Show a user's stored gallery
    List {
        /// User ID
        #[arg(short, long)]
        user: u64,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("gallerybot={}", log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        GalleryBotConfig::load(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        GalleryBotConfig::default()
    };

    match cli.command {
        Commands::Run { events, audit } => {
            run(config, events, audit).await?;
        }
        Commands::List { user } => {
            list(&config, user).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run(config: GalleryBotConfig, events: Option<PathBuf>, audit: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Gallerybot");

    let blobs = Arc::new(FsBlobStore::new(config.storage.base_dir.clone()).await?);
    let store = Arc::new(ArtifactStore::open(blobs, &config.storage).await?);
    let designs = Arc::new(FsBlobStore::new(config.storage.cpuinfo_dir.clone()).await?);
    let cpuinfo = Arc::new(CpuInfoRegistry::open(designs, store.clone()).await?);
    let players = Arc::new(PlayerRegistry::new());
    players.init().await;

    let discord = match &config.discord {
        Some(discord) => Some(Arc::new(DiscordClient::new(discord.clone())?)),
        None => None,
    };

    let reader: Arc<dyn AuditLogReader> = match (&audit, &discord) {
        (Some(path), _) => Arc::new(
            MemoryAuditLog::load_json(path)
                .await
                .with_context(|| format!("loading audit fixture {}", path.display()))?,
        ),
        (None, Some(client)) => client.clone(),
        (None, None) => {
            tracing::warn!("No audit source configured, every removal will read as voluntary");
            Arc::new(MemoryAuditLog::new())
        }
    };
    let sink: Arc<dyn NotificationSink> = match &discord {
        Some(client) => client.clone(),
        None => Arc::new(LogSink),
    };

    let attributor = Arc::new(EventAttributor::new(reader, config.attribution.clone()));
    let (notify_channel, allowed_guilds) = config
        .discord
        .as_ref()
        .map(|d| (d.notify_channel_id, d.allowed_guilds.clone()))
        .unwrap_or_default();

    let (handle, task) = Dispatcher::new(store, attributor, players, cpuinfo, sink)
        .with_notify_channel(notify_channel)
        .with_allowed_guilds(allowed_guilds)
        .with_sweep_interval(config.storage.sweep_interval())
        .start(64);

    let input: Box<dyn AsyncRead + Unpin + Send> = match &events {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(input).lines();
    let mut feed = SignalFeed::new(handle.clone());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match serde_json::from_str::<SignalRecord>(line) {
                    Ok(record) => feed.push(record),
                    Err(e) => println!("error: invalid signal: {}", e),
                }
            }
            Some(reply) = feed.next_reply(), if feed.pending() > 0 => print_reply(reply),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    // Answer everything already read before stopping
    while let Some(reply) = feed.next_reply().await {
        print_reply(reply);
    }

    tracing::info!("Shutting down...");
    drop(feed);
    drop(handle);
    task.await?;

    Ok(())
}

fn print_reply(reply: gallerybot::Result<String>) {
    match reply {
        Ok(reply) => println!("{}", reply),
        Err(e) => println!("error: {}", e),
    }
}

async fn list(config: &GalleryBotConfig, user: u64) -> Result<()> {
    let blobs = Arc::new(FsBlobStore::new(config.storage.base_dir.clone()).await?);
    let store = ArtifactStore::open(blobs, &config.storage).await?;
    let artifacts = store.list(user).await;

    if artifacts.is_empty() {
        println!("No artifacts stored for {}", user);
        return Ok(());
    }

    for (i, artifact) in artifacts.iter().enumerate() {
        println!(
            "{:>2}. {:<32} {}  {} bytes",
            i + 1,
            artifact.name,
            artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
            artifact.size()
        );
    }
    println!("{}/{} slots used", artifacts.len(), store.capacity());

    Ok(())
}

fn show_config(config: Option<&GalleryBotConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
