//! Hub Appliance daemon entrypoint: loads config, connects to Postgres,
//! runs migrations, wires the kernel and HTTP surface, and spawns every
//! background service under one `ServiceHost`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use vmhub::async_poller::{AsyncPoller, AsyncPollerConfig};
use vmhub::clients::{HttpSourceAgentClient, ReqwestIaasClient};
use vmhub::config::Config;
use vmhub::jobs::JobTracker;
use vmhub::kernel::service_host::ServiceHost;
use vmhub::logging::LogRotator;
use vmhub::progress_poller::{ProgressPoller, ProgressPollerConfig};
use vmhub::recovery::{HealthMonitor, Recovery};
use vmhub::server::{self, AppState};
use vmhub::state_sync::{StateCache, StateSync};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = Config::from_env()?;

    let db = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let iaas = Arc::new(ReqwestIaasClient::new(std::env::var("IAAS_BASE_URL")?));
    let source_agent = Arc::new(HttpSourceAgentClient::new(
        std::env::var("SOURCE_AGENT_BASE_URL")?,
        config.legacy_not_found_body,
    ));

    let tracker = Arc::new(JobTracker::new(db.clone()));
    let state_cache = Arc::new(StateCache::new());

    let mut host = ServiceHost::new();

    host.spawn(Box::new(AsyncPoller::new(
        db.clone(),
        tracker.clone(),
        iaas.clone(),
        AsyncPollerConfig {
            poll_tick: config.async_poll_interval,
            poll_interval: config.async_poll_interval,
            max_concurrent_polls: config.max_concurrent_polls,
        },
    )));

    host.spawn(Box::new(ProgressPoller::new(
        db.clone(),
        source_agent.clone(),
        ProgressPollerConfig {
            poll_tick: config.progress_poll_interval,
            grace_period: config.startup_grace_period,
            max_transport_errors: 5,
            max_concurrent_polls: config.max_concurrent_polls,
        },
    )));

    let recovery = Arc::new(Recovery::new(db.clone(), source_agent.clone()));
    recovery.run_startup_reconciliation().await?;
    host.spawn(Box::new(HealthMonitor::new(
        recovery.clone(),
        config.health_monitor_interval,
        config.stale_threshold,
    )));

    let state_sync = Arc::new(StateSync::new(iaas.clone(), state_cache.clone(), config.max_sync_errors));
    host.spawn(Box::new(state_sync.clone()));

    host.spawn(Box::new(LogRotator::new(
        config.log_dir.clone(),
        config.max_log_files,
        Duration::from_secs(config.rotation_hours * 3600),
    )));

    let app_state = Arc::new(AppState {
        db: db.clone(),
        tracker: tracker.clone(),
        state_cache: state_cache.clone(),
        state_sync: state_sync.clone(),
    });
    let app = server::build_router(app_state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;

    tracing::info!(port = config.port, "hub appliance listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "http server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    host.shutdown(Duration::from_secs(10)).await;

    Ok(())
}
