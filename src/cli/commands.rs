//! CLI commands implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{Config, EXAMPLE_CONFIG};
use crate::engine::{BreakerState, Engine, ImmediateScrape};
use crate::notify::LogSink;
use crate::repository::{EngineStore, SqliteStore};

#[derive(Parser)]
#[command(name = "pricewatch")]
#[command(about = "Demand-driven retail price scraping and validation engine")]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "pricewatch.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the engine: workers, refresh planner, discovery
    Run,

    /// Search retailers for a product and register matching listings
    Discover {
        /// Search query, e.g. "whey isolate 1kg"
        query: String,
        /// Restrict to specific retailer ids (default: all configured)
        #[arg(short, long)]
        retailer: Vec<String>,
    },

    /// Scrape one listing right now and print the result
    Scrape {
        /// Listing id
        listing_id: Uuid,
        /// Seconds to wait for the result before giving up
        #[arg(short, long, default_value = "60")]
        wait: u64,
    },

    /// Show engine health: queue depth, per-retailer breaker state
    Status,

    /// List tracked listings
    Listings {
        /// Restrict to one retailer
        #[arg(short, long)]
        retailer: Option<String>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        return init(&cli.config, *force);
    }

    let config = Config::load(&cli.config)?;
    let store = Arc::new(
        SqliteStore::open(&config.engine.database_path)
            .context("opening the pricewatch database")?,
    );
    let registry = Arc::new(Engine::build_registry(&config)?);
    let engine = Engine::new(
        config,
        Some(cli.config.clone()),
        store,
        registry,
        Arc::new(LogSink),
    )
    .await?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Run => run_engine(&engine).await,
        Commands::Discover { query, retailer } => discover(&engine, &query, retailer).await,
        Commands::Scrape { listing_id, wait } => {
            scrape(&engine, listing_id, Duration::from_secs(wait)).await
        }
        Commands::Status => status(&engine),
        Commands::Listings { retailer } => listings(&engine, retailer.as_deref()).await,
    }
}

fn init(path: &PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }
    std::fs::write(path, EXAMPLE_CONFIG)
        .with_context(|| format!("writing {}", path.display()))?;
    println!(
        "{} wrote starter config to {}",
        style("ok").green().bold(),
        path.display()
    );
    println!("Edit the retailer selectors, then run: pricewatch run");
    Ok(())
}

/// Run workers until Ctrl-C, then drain with a hard deadline.
async fn run_engine(engine: &Arc<Engine>) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(stop_rx).await })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    println!("\n{} shutting down...", style("signal").yellow());
    let _ = stop_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(30), runner).await {
        Ok(joined) => joined??,
        Err(_) => eprintln!("{} drain deadline passed, exiting", style("warn").yellow()),
    }
    Ok(())
}

async fn discover(engine: &Arc<Engine>, query: &str, retailers: Vec<String>) -> Result<()> {
    println!("Searching for {}...", style(query).cyan());
    let request = engine
        .run_discovery_blocking(query, retailers, None)
        .await?;

    println!(
        "{} request {} {}: {} listing(s)",
        style("done").green().bold(),
        request.id,
        request.status.as_str(),
        request.listing_ids.len()
    );
    for listing_id in &request.listing_ids {
        if let Some(listing) = engine.store().get_listing(*listing_id).await? {
            println!(
                "  {}  {}  {}  {}",
                listing.id,
                style(&listing.retailer_id).dim(),
                listing.variant,
                listing.url
            );
        }
    }
    for error in &request.errors {
        println!(
            "  {} {}: {}",
            style("error").red(),
            error.retailer_id,
            error.message
        );
    }
    Ok(())
}

/// One-shot scrape: spin the engine up just long enough to run the task.
async fn scrape(engine: &Arc<Engine>, listing_id: Uuid, wait: Duration) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(stop_rx).await })
    };

    let outcome = engine.submit_immediate_scrape(listing_id, wait).await;
    let _ = stop_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(10), runner).await;

    match outcome? {
        ImmediateScrape::Fresh(observation) => {
            println!(
                "{} {} at {} ({}, confidence {:.2})",
                style("price").green().bold(),
                observation.price,
                observation.recorded_at,
                observation.verdict.as_str(),
                observation.confidence
            );
            if let Some(pct) = observation.change_percent {
                println!("  change: {pct:+.1}%");
            }
        }
        ImmediateScrape::Unavailable { .. } => {
            println!(
                "{} price unavailable right now, retry later",
                style("pending").yellow()
            );
        }
    }
    Ok(())
}

fn status(engine: &Arc<Engine>) -> Result<()> {
    let health = engine.health();
    println!("queue depth: {}", style(health.queue_depth).bold());
    if health.retailers.is_empty() {
        println!("no retailer traffic yet");
        return Ok(());
    }
    for retailer in &health.retailers {
        let breaker = match retailer.breaker {
            BreakerState::Closed => style("closed").green(),
            BreakerState::Open => style("open").red().bold(),
        };
        println!(
            "  {:<20} success {:>5.1}%  breaker {}  ({} samples)",
            retailer.retailer_id,
            retailer.success_rate * 100.0,
            breaker,
            retailer.samples
        );
    }
    Ok(())
}

async fn listings(engine: &Arc<Engine>, retailer: Option<&str>) -> Result<()> {
    let listings = engine.store().load_active_listings(retailer).await?;
    if listings.is_empty() {
        println!("no active listings; run `pricewatch discover <query>` first");
        return Ok(());
    }
    for listing in listings {
        let price = listing
            .last_known_price
            .map(|p| format!("{p:.2}"))
            .unwrap_or_else(|| "-".into());
        let scraped = listing
            .last_scraped_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "{}  {:<12} {:<40} {:>10}  last {}",
            listing.id,
            style(&listing.retailer_id).dim(),
            listing.variant,
            price,
            scraped
        );
    }
    Ok(())
}
