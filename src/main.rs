//! linkwatch - connectivity downtime monitor.
//!
//! Probes a gateway and external anchors, records outages in SQLite,
//! sends alerts on transitions and serves a status page.

mod config;
mod db;
mod notify;
mod probe;
mod scheduler;
mod stats;
mod web;

use config::ServerConfig;
use db::Store;
use notify::{AlertChannel, LogChannel, NotificationDispatcher, WebhookChannel};
use probe::Prober;
use scheduler::Scheduler;
use stats::{AggregationEngine, StatusQueryService};
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("linkwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    let db_path = cfg.resolve_db_path();
    tracing::info!("Starting linkwatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", db_path.display());

    // Initialize database
    let store = Arc::new(Store::new(&db_path)?.with_link_name(&cfg.link_name));
    tracing::info!("Database initialized successfully");

    for target in &cfg.targets {
        tracing::info!("Probing {} via {:?} (timeout {:?})", target.name(), target.kind, target.timeout);
    }
    let prober = Prober::new(cfg.targets.clone(), cfg.policy, cfg.interface.clone());

    let channel = match &cfg.webhook_url {
        Some(url) => AlertChannel::Webhook(WebhookChannel::new(
            url,
            cfg.webhook_token.clone(),
            Duration::from_secs(10),
        )?),
        None => {
            tracing::info!("No webhook configured, alerts are logged only");
            AlertChannel::Log(LogChannel)
        }
    };
    let dispatcher = NotificationDispatcher::new(channel, store.clone(), cfg.dispatch_settings());

    // Start scheduler
    let mut scheduler = Scheduler::new(store.clone());
    let link = scheduler.start(
        prober,
        cfg.thresholds(),
        cfg.probe_interval,
        dispatcher,
        cfg.retention(),
    );

    // Start web server
    let status = Arc::new(StatusQueryService::new(AggregationEngine::new(store.clone())));
    let server = Server::new(cfg, store, status, link);
    let result = server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await;

    scheduler.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!("linkwatch stopped");

    result
}
