//! Invite Giveaways Server
//!
//! Runs the engine: scheduler, member event loop and the HTTP command surface.

use std::sync::Arc;

use invite_giveaways::scheduler::{self, BackgroundTasks, ShutdownHandle, SystemClock, TaskRunner};
use invite_giveaways::storage::open_repository;
use invite_giveaways::{Config, DiscordClient, GiveawayService, GiveawayStore};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Member-joined events buffered between the relay endpoint and the engine.
const EVENT_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Invite Giveaways Server");

    let config = Config::load()?;
    if config.discord.guild_id.is_empty() {
        error!("GUILD_ID is required");
        anyhow::bail!("GUILD_ID not set");
    }

    let repo = open_repository(&config.database).await?;
    let store = Arc::new(GiveawayStore::new(repo, config.settings.clone()));
    store.hydrate().await?;

    let platform = Arc::new(DiscordClient::new(&config.discord));
    let service = Arc::new(GiveawayService::new(
        store,
        platform,
        Arc::new(SystemClock),
    ));

    let shutdown = ShutdownHandle::new();

    let mut tasks = BackgroundTasks::new(shutdown.clone());

    // Background scheduler (expiry sweep, leaderboard refresh, daily post)
    let runner: Arc<dyn TaskRunner> = service.clone();
    tasks.spawn(
        "scheduler",
        scheduler::run_loop(service.scheduler(), runner, shutdown.subscribe()),
    );
    info!("Background scheduler started");

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    tasks.spawn(
        "event loop",
        service
            .clone()
            .run_event_loop(events_rx, shutdown.subscribe()),
    );

    let server_shutdown = shutdown.clone();
    let signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
        server_shutdown.trigger();
    };

    let served = invite_giveaways::server::run_server(
        &config.server.host,
        config.server.port,
        service,
        events_tx,
        signal,
    )
    .await;

    // Let in-flight sweeps and joins finish before the runtime goes away
    tasks.shutdown().await;

    info!("Server stopped");
    served
}
