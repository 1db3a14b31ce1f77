//! Congest Daemon
//!
//! Hosts one congestion service: loads the rule file, keeps it hot-reloaded,
//! sweeps idle entries in the background and serves the operator socket.

use congest_admin::AdminServer;
use congest_core::{CongestionService, RuleSet};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod settings;
mod sweeper;
mod watcher;

use settings::Settings;

/// The primary entrypoint for the congestion daemon.
///
/// Initializes logging and the multi-threaded Tokio runtime, loads the rule
/// file, and runs until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "congest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting congestion daemon...");

    let settings = Settings::from_env();
    tracing::info!(
        config = %settings.config_path.display(),
        partitions = settings.partitions,
        sweep_ms = settings.sweep_interval.as_millis() as u64,
        "settings loaded"
    );

    // start with no rules; everything is allowed until a file loads
    let service = Arc::new(CongestionService::new(RuleSet::default(), settings.partitions));
    if watcher::reload_rules(&settings.config_path, &settings.defaults, &service).is_none() {
        tracing::warn!("No congestion rules active; all destinations are admitted");
    }

    let sweeper = sweeper::spawn_sweeper(Arc::clone(&service), settings.sweep_interval);

    let watch_service = Arc::clone(&service);
    let watch_path = settings.config_path.clone();
    let watch_defaults = settings.defaults.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher::watch_rule_file(watch_path, watch_defaults, watch_service).await {
            tracing::error!("Rule file watcher failed: {}", e);
        }
    });

    let admin = AdminServer::new(Arc::clone(&service), settings.local_time);
    let admin_socket = settings.admin_socket.clone();
    tokio::spawn(async move {
        if let Err(e) = admin.run(admin_socket).await {
            tracing::error!("Admin server failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully.");

    sweeper.abort();
    service.flush();
    if let Err(e) = std::fs::remove_file(&settings.admin_socket) {
        tracing::debug!("Admin socket not removed: {}", e);
    }
    Ok(())
}
