//! Pushwire push notification delivery daemon.
//!
//! Loads configuration, connects to Postgres, bootstraps the schema and runs
//! the delivery daemon until a shutdown signal arrives (or, in push mode,
//! until the single cycle has been delivered).

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use pushwire_core::{storage::postgres::ensure_schema, Clock, PgStore, RealClock};
use pushwire_delivery::{Daemon, DefaultGatewayFactory};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        batch_size = config.batch_size,
        push_poll_seconds = config.push_poll,
        embedded = config.embedded,
        push = config.push,
        "configuration loaded"
    );

    let pool = Arc::new(create_database_pool(&config).await?);
    ensure_schema(&pool).await.context("failed to bootstrap schema")?;
    info!("database ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = Arc::new(
        PgStore::new(pool.clone(), clock.clone()).with_reconnect_policy(config.reconnect_policy()),
    );
    let gateways = Arc::new(DefaultGatewayFactory::new(config.http_gateway_config()));
    let daemon = Arc::new(Daemon::new(store, clock, gateways, config.daemon_config()));

    if config.embedded {
        daemon.start().await?;
        shutdown_signal().await;
    } else {
        let stopper = tokio::spawn({
            let daemon = daemon.clone();
            async move {
                shutdown_signal().await;
                daemon.feeder().stop().await;
            }
        });
        daemon.start().await?;
        stopper.abort();
    }

    info!("shutting down");
    if let Err(e) = daemon.shutdown().await {
        warn!(error = %e, "daemon did not shut down cleanly");
    }

    pool.close().await;
    info!("pushwire stopped");
    Ok(())
}

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects the pool, retrying while the database is still coming up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(config.database_acquire_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(attempt = retries, max_retries = MAX_RETRIES, error = %e, "database connection failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Resolves on CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
