//! Pinwatch: a retail delivery-availability monitor.
//!
//! This is the application entry point. It initializes tracing, loads
//! configuration from a TOML file, opens the per-user store, builds the proxy
//! pool and API client, and either runs the periodic scheduler (the default),
//! fires one manual fleet check, or prints a user's status.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pinwatch::auth::SessionManager;
use pinwatch::commands::CommandService;
use pinwatch::config::{
    AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER, NOTIFICATION_QUEUE_CAPACITY,
};
use pinwatch::monitor::{CheckOrchestrator, DedupStore, Scheduler};
use pinwatch::notify::{NotificationDispatcher, QueueDispatcher};
use pinwatch::state::AppState;
use pinwatch::store::UserStore;
use pinwatch::upstream::client::{ApiClient, HttpTransport};
use pinwatch::upstream::proxy::ProxyPool;

/// Pinwatch: watch retail listings for products deliverable to your pincodes
#[derive(Parser, Debug)]
#[command(name = "pinwatch", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "pinwatch=debug")
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitor service (the default)
    Run,
    /// Trigger one fleet-wide check and exit
    Check,
    /// Show a user's configuration and counters
    Status {
        /// User id to inspect
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::info!("Loaded configuration");

    let store = Arc::new(UserStore::open(&config.storage.data_dir)?);

    let pool = Arc::new(ProxyPool::from_config(&config.proxy));
    tracing::info!(
        enabled = config.proxy.enabled,
        endpoints = config.proxy.endpoints.len(),
        checkout = config.proxy.checkout.is_some(),
        "Proxy pool configured"
    );

    let transport = Arc::new(HttpTransport::new(&config.upstream, pool));
    let client = ApiClient::new(&config.upstream, transport);
    let sessions = SessionManager::new(client.clone());

    let (dispatcher, notifications) = QueueDispatcher::new(NOTIFICATION_QUEUE_CAPACITY);
    let dispatcher: Arc<dyn NotificationDispatcher> = Arc::new(dispatcher);

    let orchestrator = CheckOrchestrator::new(
        client,
        DedupStore::new(
            config.storage.retention_days,
            config.storage.max_seen_entries,
        ),
        dispatcher.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        orchestrator,
        &config.scheduler,
        config.access.authorized_users.clone(),
        shutdown_rx,
    ));

    // Log configured users
    for user_id in &config.access.authorized_users {
        let ctx = store.load(user_id).await?;
        tracing::info!(
            user = %user_id,
            urls = ctx.monitor_urls.len(),
            pincodes = ctx.pincodes.len(),
            auth = ctx.auth.label(),
            "User configured"
        );
    }

    let commands = CommandService::new(AppState::new(
        config,
        store,
        sessions,
        scheduler.clone(),
        dispatcher,
    ));

    // Drain the notification queue. This is the hand-off point for a chat
    // front end; standalone, findings go to the log.
    tokio::spawn(async move {
        while let Ok(record) = notifications.recv().await {
            tracing::info!(
                user = %record.user_id,
                pincode = %record.pincode,
                link = %record.product_url,
                "DELIVERY AVAILABLE"
            );
        }
    });

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            setup_shutdown_handler(shutdown_tx);
            scheduler.run_periodic().await;
            tracing::info!("Shut down cleanly");
        }
        Command::Check => {
            let summary = commands.trigger_manual_check().await?;
            tracing::info!(
                checked = summary.users_checked,
                failed = summary.users_failed,
                deliverable = summary.deliverable,
                needs_relogin = summary.needs_relogin.len(),
                "Manual check finished"
            );
        }
        Command::Status { user } => {
            let status = commands.get_status(&user).await?;
            tracing::info!(
                user = %status.user_id,
                urls = status.monitor_urls.len(),
                pincodes = ?status.pincodes,
                auth = %status.auth_state,
                seen = status.seen_count,
                deliverable = status.deliverable_count,
                pending = status.pending_count,
                last_check = ?status.last_check,
                "User status"
            );
        }
    }

    Ok(())
}

/// Flip the shutdown flag on SIGTERM or Ctrl+C. The scheduler finishes the
/// user it is on and stops between users.
fn setup_shutdown_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });
}
