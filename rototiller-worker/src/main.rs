//! Rototiller Worker binary
//!
//! Wires the Postgres catalog and bus, the filesystem blob store and the
//! orchestrator together, then consumes job events until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use rototiller_bus::PgEventBus;
use rototiller_store::db::{self, PgPool};
use rototiller_store::{FsBlobStore, PgCatalog};
use rototiller_worker::api::{self, AppState};
use rototiller_worker::{Config, Orchestrator, Reaper, TaskRunner, WorkDir, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rototiller_worker=info,rototiller_bus=info,rototiller_store=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rototiller Worker");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: working_dir={}, concurrency={}, consumer_id={}",
        config.working_dir.display(),
        config.concurrency,
        config.consumer_id
    );

    // Jobs, the bus listener and the reaper each hold a connection at times
    let pool = connect_with_retry(&config.postgres_addr, config.concurrency as u32 + 4).await?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run catalog migrations")?;

    let bus = Arc::new(
        PgEventBus::connect(pool.clone(), config.bus.clone())
            .await
            .context("Failed to set up event bus")?,
    );
    let catalog = Arc::new(PgCatalog::new(pool));
    let blobs = Arc::new(FsBlobStore::new(&config.bucket_dir));

    info!("Stores initialized (bucket: {})", config.bucket_dir.display());

    let workers = WorkerPool::new(config.concurrency);
    let orchestrator = Orchestrator::new(
        bus.clone(),
        catalog.clone(),
        blobs,
        WorkDir::new(&config.working_dir),
        TaskRunner::new(config.task_bin_dir.clone()),
        workers.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let reaper = if config.reaper_enabled() {
        let reaper = Reaper::new(catalog, bus, config.stale_job_after, config.reap_interval);
        Some(tokio::spawn(reaper.run(shutdown(shutdown_rx.clone()))))
    } else {
        info!("Stale-job reaper disabled");
        None
    };

    let app = api::create_router(AppState {
        consumer_id: Arc::from(config.consumer_id.as_str()),
        pool: workers,
    });
    let listener = tokio::net::TcpListener::bind(config.health_addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint to {}", config.health_addr))?;
    info!("Health endpoint listening on {}", config.health_addr);

    let server_shutdown = shutdown(shutdown_rx.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown)
            .await
    });

    let result = orchestrator
        .run(&config.consumer_id, shutdown(shutdown_rx))
        .await;

    if result.is_err() {
        // No signal arrived; stop the side tasks directly
        if let Some(reaper) = &reaper {
            reaper.abort();
        }
        server.abort();
    }

    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    match server.await {
        Ok(Err(e)) => warn!("Health endpoint failed: {}", e),
        Ok(Ok(())) | Err(_) => {}
    }

    match result {
        Ok(()) => {
            info!("Worker stopped");
            Ok(())
        }
        Err(e) => {
            error!("Worker stopped on bus failure: {}", e);
            Err(e).context("Event bus failed")
        }
    }
}

/// Resolves once shutdown has been requested
async fn shutdown(mut rx: watch::Receiver<bool>) {
    // A closed channel means the signal task is gone; keep running
    if rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Connects to Postgres with retry logic and exponential backoff
///
/// The database may not be ready yet when the worker starts (common in
/// container environments).
async fn connect_with_retry(database_url: &str, max_connections: u32) -> Result<PgPool> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match db::create_pool(database_url, max_connections).await {
            Ok(pool) => {
                if attempt > 1 {
                    info!("Connected to database after {} attempt(s)", attempt);
                }
                return Ok(pool);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to connect to database after {} attempts", MAX_RETRIES);
                    return Err(e).context("Failed to connect to database");
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
