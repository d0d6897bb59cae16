use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use feedsync::config::Config;
use feedsync::events::{Notifier, SyncEvent};
use feedsync::feed::{Fetcher, NewsApiParser, ParserChain};
use feedsync::storage::{Database, DatabaseError};
use feedsync::sync::{error_chain, reset_custom_feed_store, Scheduler, Synchronizer};

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // User-only access: the database holds subscriptions and the config may hold an API key
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Feed synchronization engine", version)]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronize all subscribed feeds periodically until interrupted
    Run,
    /// Synchronize one feed now
    Sync {
        /// Feed or site URL
        url: String,
    },
    /// Subscribe a user to a feed, creating the user if needed
    Subscribe {
        #[arg(long, value_name = "NAME")]
        user: String,
        /// Category to file the subscription under
        #[arg(long, value_name = "NAME")]
        category: Option<String>,
        /// Feed or site URL
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedsync=info")),
        )
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    ensure_config_dir(&config_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| config_dir.join("feedsync.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: the database is locked by another process. Close it and try again.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let fetcher = Fetcher::from_config(&config).context("Failed to create HTTP client")?;
    let news_api = NewsApiParser::new(
        fetcher.clone(),
        config.news_api_base_url.clone(),
        config.news_api_key(),
    );
    let parsers = Arc::new(ParserChain::standard(fetcher, news_api));

    let (notifier, events) = Notifier::channel(config.event_channel_capacity);
    let consumer = tokio::spawn(log_events(events));
    let synchronizer = Synchronizer::new(db, parsers, notifier);

    let result = match args.command {
        Command::Run => run(&config, synchronizer).await,
        Command::Sync { url } => sync_once(synchronizer, &url).await,
        Command::Subscribe {
            user,
            category,
            url,
        } => subscribe(synchronizer, &user, category.as_deref(), &url).await,
    };

    // The synchronizer held the last sender, so the consumer drains and exits
    if let Err(e) = consumer.await {
        tracing::warn!(error = %e, "Event consumer stopped abnormally");
    }
    result
}

async fn run(config: &Config, synchronizer: Synchronizer) -> Result<()> {
    if let Some(store) = &config.custom_feed_store {
        if let Err(e) = reset_custom_feed_store(store) {
            tracing::warn!(path = %store.display(), error = %e, "Failed to reset custom feed store");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        interval_minutes = config.sync_interval_minutes,
        concurrency = config.sync_concurrency,
        "Scheduler started"
    );
    Scheduler::from_config(synchronizer, config)
        .run(shutdown_rx)
        .await;
    Ok(())
}

async fn sync_once(synchronizer: Synchronizer, url: &str) -> Result<()> {
    match synchronizer.synchronize(url).await {
        Ok(report) => {
            println!(
                "{}: {} created, {} updated, {} removed ({} ms)",
                report.feed.title,
                report.created,
                report.updated,
                report.removed,
                report.duration.as_millis()
            );
            Ok(())
        }
        Err(e) => anyhow::bail!("{}", error_chain(&e)),
    }
}

async fn subscribe(
    synchronizer: Synchronizer,
    username: &str,
    category: Option<&str>,
    url: &str,
) -> Result<()> {
    let db = synchronizer.database();
    let user = db
        .find_or_create_user(username)
        .await
        .context("Failed to find or create user")?;
    let category_id = match category {
        Some(name) => Some(
            db.find_or_create_category(user.id, name)
                .await
                .context("Failed to find or create category")?
                .id,
        ),
        None => None,
    };

    let subscription = synchronizer
        .subscribe(user.id, url, category_id)
        .await
        .map_err(|e| anyhow::anyhow!("{}", error_chain(&e)))?;
    println!(
        "Subscribed {} to feed {} ({} unread)",
        user.username, subscription.feed_id, subscription.unread_count
    );
    Ok(())
}

/// Stand-in consumer for the index and favicon subsystems.
async fn log_events(mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::ArticlesCreated(articles) => {
                tracing::debug!(count = articles.len(), "Articles to index")
            }
            SyncEvent::ArticlesUpdated(articles) => {
                tracing::debug!(count = articles.len(), "Articles to reindex")
            }
            SyncEvent::ArticlesDeleted(articles) => {
                tracing::debug!(count = articles.len(), "Articles to drop from index")
            }
            SyncEvent::FaviconRefreshRequested(feed) => {
                tracing::debug!(feed = %feed.rss_url, "Favicon refresh requested")
            }
        }
    }
}
