//! countertrail - database performance counter collector.
//!
//! Polls counter exporters on a per-collector cadence, turns cumulative
//! counters into interval deltas, stores everything in SQLite and raises
//! threshold alerts.

mod alert;
mod collector;
mod config;
mod db;
mod delta;
mod events;
mod scheduler;
mod settings;
mod web;

use alert::{AlertEvaluator, LogNotifier, Notifier, WebhookNotifier};
use collector::HttpCounterAdapter;
use config::ServerConfig;
use db::Store;
use delta::DeltaEngine;
use events::EventBus;
use scheduler::{Orchestrator, RetentionManager, ScheduleManager};
use settings::SettingsHandle;
use web::{AppState, Server};

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("countertrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting countertrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database; refuses to start on a newer schema
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized at schema version {:?}", store.schema_version()?);

    let settings = Arc::new(SettingsHandle::load(store.clone())?);
    let bus = EventBus::new();

    // Alert delivery
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &cfg.webhook_url {
        tracing::info!("Delivering alerts to webhook {}", url);
        notifiers.push(Arc::new(WebhookNotifier::new(url.clone(), Duration::from_secs(10))?));
    }
    let dispatcher = alert::spawn_dispatcher(&bus, notifiers);

    // Collection pipeline
    let schedule = Arc::new(ScheduleManager::load(store.clone())?);
    let alerts = Arc::new(AlertEvaluator::load(store.clone())?);
    let adapter = Arc::new(HttpCounterAdapter::new(cfg.adapter_timeout)?);
    let orchestrator = Orchestrator::new(
        store.clone(),
        schedule,
        Arc::new(DeltaEngine::new()),
        alerts,
        adapter,
        settings.subscribe(),
        bus.clone(),
    );
    orchestrator.start();

    let retention = Arc::new(RetentionManager::new(
        store.clone(),
        cfg.archive_dir.clone(),
        settings.subscribe(),
    ));
    retention.start();

    // Serve the API until Ctrl-C
    let server = Server::new(AppState {
        config: cfg,
        store,
        orchestrator: orchestrator.clone(),
        settings,
        retention: retention.clone(),
    });
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    retention.stop().await;
    orchestrator.shutdown().await;
    dispatcher.abort();

    Ok(())
}
