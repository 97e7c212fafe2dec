//! Token Mention Watcher - channel monitor with market-data enrichment
//!
//! Consumes messages from the configured channels, extracts token
//! contract addresses, enriches them via the price API and posts
//! qualifying alerts to the configured webhook.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

// Use the library crate
use tokenwatch::cache::{TokenCacheConfig, TokenInfoCache};
use tokenwatch::config::Config;
use tokenwatch::dexscreener::DexScreenerClient;
use tokenwatch::enrich::AddressEnricher;
use tokenwatch::monitor::{ChannelMonitor, FilterSettings, MonitorLimits};
use tokenwatch::notify::{LogSink, NotificationSink, WebhookSink};
use tokenwatch::stream::gateway::{GatewayClient, GatewayConfig};

/// Token Mention Watcher - alerts on token mentions in chat channels
#[derive(Parser)]
#[command(name = "tokenwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start watching the configured channels
    Start {
        /// Log alerts instead of delivering them to the webhook
        #[arg(long)]
        dry_run: bool,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tokenwatch=info".parse().unwrap()),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Config => {
            println!("{:#?}", config.masked());
            Ok(())
        }
        Commands::Start { dry_run } => start(config, dry_run).await,
    }
}

async fn start(config: Config, dry_run: bool) -> Result<()> {
    info!("Starting token info cache...");
    let price_source = Arc::new(DexScreenerClient::new());
    let cache = Arc::new(TokenInfoCache::new(
        TokenCacheConfig {
            cache_file: config.cache.file.clone().into(),
            update_interval_secs: config.cache.update_interval_secs,
        },
        price_source,
    ));
    cache.start().await?;

    info!("Initializing address enricher...");
    let enricher = Arc::new(AddressEnricher::new(cache.clone()));

    info!("Initializing gateway client...");
    let gateway = Arc::new(GatewayClient::new(GatewayConfig {
        ws_url: config.gateway.ws_url.clone(),
        channels: config.gateway.channels.clone(),
        reconnect_delay_ms: config.gateway.reconnect_delay_ms,
        max_reconnect_attempts: config.gateway.max_reconnect_attempts,
        ping_interval_secs: config.gateway.ping_interval_secs,
        queue_capacity: config.gateway.queue_capacity,
    }));

    let sink: Arc<dyn NotificationSink> = if dry_run {
        info!("Dry run: alerts will be logged, not delivered");
        Arc::new(LogSink)
    } else {
        Arc::new(WebhookSink::new(
            config.sink.webhook_url.clone(),
            config.sink.timeout_secs,
        ))
    };

    let filters = FilterSettings {
        allowed_chains: config.filters.allowed_chains()?,
        min_price_usd: config.filters.min_price_usd,
        min_liquidity_usd: config.filters.min_liquidity_usd,
        require_wallet_match: config.filters.require_wallet_match,
    };

    info!("Starting channel monitor...");
    let monitor = Arc::new(ChannelMonitor::new(
        gateway,
        enricher,
        sink,
        filters,
        config.wallets.clone(),
        MonitorLimits {
            max_in_flight: config.monitor.max_in_flight,
            shutdown_grace_ms: config.monitor.shutdown_grace_ms,
            max_scan_bytes: config.monitor.max_scan_bytes,
        },
    ));

    let mut run_handle = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received stop signal");
            if let Err(e) = monitor.stop().await {
                error!("Monitor stop failed: {}", e);
            }
            report_run_result(run_handle.await);
        }
        result = &mut run_handle => {
            report_run_result(result);
        }
    }

    if let Err(e) = cache.stop().await {
        error!("Cache stop failed: {}", e);
    }

    info!("Shutting down...");
    Ok(())
}

fn report_run_result(result: std::result::Result<tokenwatch::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Monitor exited with error: {}", e),
        Err(e) => error!("Monitor task failed: {}", e),
    }
}
