use std::path::PathBuf;
use std::sync::Arc;

use agora_adapters::{adapter_for_site, AdapterContext, ExclusionSet};
use agora_core::SiteKey;
use agora_storage::TopicStore;
use agora_sync::{build_scheduler, open_store, select_feed, FeedConfig, ScrapeCycle, SourceRegistry, SyncConfig};
use agora_web::AppState;
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "agora")]
#[command(about = "Forum topic aggregator: scrape, merge and serve one ranked feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape on an interval and serve the web UI until interrupted.
    Run {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single scrape cycle and print its report.
    Scrape,
    /// Serve the web UI without scraping.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the current feed as JSON.
    Feed,
    /// Parse a saved listing page and print the drafts as JSON.
    Parse {
        #[arg(long)]
        site: SiteKey,
        #[arg(long)]
        file: PathBuf,
        /// Ignore the built-in exclusion list.
        #[arg(long)]
        no_exclusions: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { port: None }) {
        Commands::Run { port } => run(&config, port.unwrap_or_else(agora_web::port_from_env)).await?,
        Commands::Scrape => {
            let store = open_shared_store(&config).await?;
            let cycle = build_cycle(&config, store).await?;
            let report = cycle.run_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve { port } => {
            let store = open_shared_store(&config).await?;
            let state = AppState::new(store, FeedConfig::from_env());
            agora_web::serve_with_shutdown(state, port.unwrap_or_else(agora_web::port_from_env), shutdown_signal())
                .await?;
        }
        Commands::Feed => {
            let store = open_shared_store(&config).await?;
            let feed = select_feed(store.as_ref(), &FeedConfig::from_env(), Utc::now().fixed_offset()).await?;
            println!("{}", serde_json::to_string_pretty(&feed)?);
        }
        Commands::Parse {
            site,
            file,
            no_exclusions,
        } => {
            let markup = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let exclusions = if no_exclusions {
                ExclusionSet::default()
            } else {
                configured_exclusions(&config, site).await
            };
            let ctx = AdapterContext::new(Utc::now(), config.forum_offset());
            let drafts = adapter_for_site(site, exclusions).parse_listing(&ctx, &markup);
            println!("{}", serde_json::to_string_pretty(&drafts)?);
        }
    }

    Ok(())
}

async fn run(config: &SyncConfig, port: u16) -> Result<()> {
    let store = open_shared_store(config).await?;
    let cycle = Arc::new(build_cycle(config, store.clone()).await?);

    let first = Arc::clone(&cycle);
    let first_run = tokio::spawn(async move {
        first.run_once().await;
    });

    let mut scheduler = if config.scheduler_enabled {
        let sched = build_scheduler(Arc::clone(&cycle), config.scrape_interval()).await?;
        sched.start().await.context("starting scheduler")?;
        info!(interval_secs = config.scrape_interval().as_secs(), "scrape scheduler started");
        Some(sched)
    } else {
        warn!("scheduler disabled; only the startup scrape will run");
        None
    };

    let state = AppState::new(store, FeedConfig::from_env());
    let served = agora_web::serve_with_shutdown(state, port, shutdown_signal()).await;

    if let Some(sched) = scheduler.as_mut() {
        if let Err(e) = sched.shutdown().await {
            warn!("scheduler shutdown failed: {e}");
        }
    }
    first_run.abort();
    info!("shutdown complete");
    served
}

async fn open_shared_store(config: &SyncConfig) -> Result<Arc<dyn TopicStore>> {
    Ok(Arc::new(open_store(config).await?))
}

async fn build_cycle(config: &SyncConfig, store: Arc<dyn TopicStore>) -> Result<ScrapeCycle> {
    let registry = SourceRegistry::load(&config.sources_path()).await?;
    ScrapeCycle::from_config(config, &registry, store)
}

/// Same exclusions `scrape` would apply; built-in ones when the registry cannot be read.
async fn configured_exclusions(config: &SyncConfig, site: SiteKey) -> ExclusionSet {
    match SourceRegistry::load(&config.sources_path()).await {
        Ok(registry) => registry.exclusions_for(site),
        Err(e) => {
            warn!("using built-in exclusions for {site}: {e:#}");
            ExclusionSet::defaults_for(site)
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,agora=debug"));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
