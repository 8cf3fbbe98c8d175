use std::sync::Arc;

use anyhow::{Context, Result};
use beach_gateway::abort::spawn_abort_listener;
use beach_gateway::background::BackgroundTasks;
use beach_gateway::config::AppConfig;
use beach_gateway::coordination_redis::RedisCoordination;
use beach_gateway::metrics;
use beach_gateway::routes;
use beach_gateway::state::AppState;
use beach_gateway::telemetry::init_tracing;
use gateway_sdk::coordination::Coordination;
use gateway_sdk::JobClient;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cfg = AppConfig::from_env().context("failed to load configuration")?;
    init_tracing(&cfg.log_filter);
    run(cfg).await
}

async fn run(cfg: AppConfig) -> Result<()> {
    let coordination = match cfg.redis_url.as_deref() {
        Some(url) => {
            let redis = RedisCoordination::connect(url)
                .await
                .context("failed to connect to redis")?;
            redis.ping().await.context("redis ping failed")?;
            Coordination::from_backend(Arc::new(redis))
        }
        None => {
            warn!("GATEWAY_REDIS_URL unset; using in-memory coordination (single replica only)");
            Coordination::in_memory()
        }
    };

    let tasks = BackgroundTasks::new();
    let jobs = JobClient::new(
        cfg.job_api_url.clone(),
        cfg.job_api_token.clone(),
        cfg.job_template(),
    )
    .with_probe_timeout(cfg.probe_timeout());
    let state = AppState::new(&cfg, &coordination, Arc::new(jobs), tasks.clone())?;
    let listener_policy = cfg
        .backoff_policy()
        .context("invalid backoff configuration")?;
    let abort_listener =
        spawn_abort_listener(coordination.aborts.clone(), state.aborts().clone(), listener_policy);

    let app = routes::router(state);

    info!(
        addr = %cfg.bind_addr,
        instance = %cfg.instance_id,
        redis = %cfg.redis_url.as_deref().unwrap_or("unset"),
        job_api = %cfg.job_api_url,
        worker_image = %cfg.worker_image,
        mount_prefix = %cfg.mount_prefix,
        session_timeout_secs = cfg.session_timeout_secs,
        lock_lease_secs = cfg.lock_lease_secs,
        proxy_timeout_secs = cfg.proxy_timeout_secs,
        "starting beach-gateway"
    );
    metrics::BOOT_COUNTER.inc();

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    abort_listener.abort();
    let aborted = tasks.shutdown(cfg.shutdown_grace()).await;
    info!(aborted_background_tasks = aborted, "graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
