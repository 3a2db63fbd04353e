//! Listing fusion core process entrypoint.
//!
//! Exposes one subcommand per long-lived component (`fusion`, `router`),
//! mirroring the teacher's `Cli`/`Commands` derive shape and
//! `tracing_subscriber::registry()` init.

use clap::{Parser, Subcommand};
use listing_fusion_core::aggregate::Aggregator;
use listing_fusion_core::bus::RedisBus;
use listing_fusion_core::config::Config;
use listing_fusion_core::fusion::FusionEngine;
use listing_fusion_core::heartbeat::{Reporter, Stats};
use listing_fusion_core::model::HeartbeatStatus;
use listing_fusion_core::notify::WebhookNotifier;
use listing_fusion_core::router::{Router, RouterConfig, RouterRuntime};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fusion-core")]
#[command(about = "Multi-source crypto listing event fusion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fusion engine (C6): normalize, dedup, aggregate, publish fused events.
    Fusion,
    /// Run the signal router (C7): route fused events to cex/hl/notify/drop.
    Router,
}

fn redis_endpoint(bus: &listing_fusion_core::config::BusConfig) -> String {
    match &bus.auth {
        Some(token) if !bus.endpoint.contains('@') => {
            bus.endpoint.replacen("redis://", &format!("redis://:{token}@"), 1)
        }
        _ => bus.endpoint.clone(),
    }
}

async fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Fusion => run_fusion(config).await,
        Commands::Router => run_router(config).await,
    }
}

async fn run_fusion(config: Config) -> anyhow::Result<()> {
    tracing::info!(node_id = %config.node_id, "starting fusion engine");

    let bus = Arc::new(RedisBus::connect(&redis_endpoint(&config.bus)).await?);
    let scoring = Arc::new(config.scoring_config());
    let aggregator = Arc::new(Aggregator::new(
        bus.clone(),
        scoring,
        config.aggregation.default_window_ms,
        config.aggregation.trusted_window_ms,
        config.dedup.first_seen_ttl_sec,
    ));
    let stats = Arc::new(Stats::default());

    let reporter = Arc::new(Reporter::new(bus.clone(), config.node_id.clone(), config.version.clone(), stats.clone()));
    let heartbeat_handle = reporter.clone().spawn();

    let engine = Arc::new(FusionEngine::new(bus, aggregator, config.dedup.ttl_sec, config.node_id.clone(), stats));

    let shutdown = shutdown_signal().await;
    engine.run(shutdown).await;

    heartbeat_handle.abort();
    reporter.publish(HeartbeatStatus::Stopped).await.ok();
    tracing::info!("fusion engine stopped");
    Ok(())
}

async fn run_router(config: Config) -> anyhow::Result<()> {
    tracing::info!(node_id = %config.node_id, "starting signal router");

    let bus = Arc::new(RedisBus::connect(&redis_endpoint(&config.bus)).await?);
    let router_cfg = RouterConfig::from_config(&config);
    let router = Arc::new(Router::new(bus.clone(), router_cfg, config.node_id.clone()));

    let notifier = Arc::new(match &config.notify.webhook_url {
        Some(url) => WebhookNotifier::new(url.clone(), config.notify.timeout_sec, config.notify.retries),
        None => WebhookNotifier::disabled(),
    });

    let stats = Arc::new(Stats::default());
    let reporter = Arc::new(Reporter::new(bus.clone(), config.node_id.clone(), config.version.clone(), stats.clone()));
    let heartbeat_handle = reporter.clone().spawn();

    let runtime = Arc::new(RouterRuntime::new(bus, router, notifier, config.node_id.clone(), stats));

    let shutdown = shutdown_signal().await;
    runtime.run(shutdown).await;

    heartbeat_handle.abort();
    reporter.publish(HeartbeatStatus::Stopped).await.ok();
    tracing::info!("signal router stopped");
    Ok(())
}
