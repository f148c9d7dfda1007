//! Postroom delivery daemon.
//!
//! Runs the background worker pool that drains the email job queue and
//! hands each job to the mail provider. Coordinates startup, database
//! bootstrap, and graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use postroom_core::RealClock;
use postroom_delivery::{
    DeliveryQueue, HttpMailTransport, PostgresJobStore, RetryingSender, RetryPolicy, WorkerPool,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!("Starting postroom delivery daemon");
    info!(
        database_url = %config.database_url_masked(),
        environment = %config.environment,
        workers = config.worker_pool_size,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    let environment = config.parsed_environment()?;

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    postroom_delivery::ensure_schema(&db_pool).await.context("failed to bootstrap schema")?;
    info!("Database schema verified");

    let clock = Arc::new(RealClock);
    let store = Arc::new(PostgresJobStore::new(db_pool.clone()));
    let queue = DeliveryQueue::new(store, clock.clone(), environment, config.to_queue_config());

    let transport = Arc::new(HttpMailTransport::new(config.to_provider_config())?);
    // Retries across attempts belong to the queue, not the send call.
    let policy = RetryPolicy::default().no_in_call_retries();
    let sender = RetryingSender::new(transport, policy, clock.clone());

    let worker_config = config.to_worker_config();
    let shutdown_timeout = worker_config.shutdown_timeout;
    let cancellation = CancellationToken::new();
    let mut pool = WorkerPool::new(queue, sender, worker_config, cancellation, clock);
    pool.spawn_workers();
    info!(environment = %environment, "Postroom is ready to deliver mail");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if let Err(e) = pool.shutdown_graceful(shutdown_timeout).await {
        tracing::warn!(error = %e, "Worker pool did not stop cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Postroom shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured filter, overridable via `RUST_LOG`.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid RUST_LOG environment variable")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
