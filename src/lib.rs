pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod grading;
pub(crate) mod repositories;
pub(crate) mod schemas;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::{extract::Request, ServiceExt};

use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::grading::credentials::CredentialPool;
use crate::grading::scorer::HttpScorer;
use crate::grading::store::PgJobStore;

async fn bootstrap() -> anyhow::Result<AppState> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let jobs = Arc::new(PgJobStore::new(db_pool, settings.queue().max_attempts));
    let credentials = CredentialPool::from_settings(&settings, &redis).await;
    let scorer = Arc::new(HttpScorer::from_settings(&settings)?);

    Ok(AppState::new(settings, jobs, credentials, scorer, redis))
}

pub async fn run() -> anyhow::Result<()> {
    let state = bootstrap().await?;
    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Grading dispatch API listening"
    );

    let result = axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
        .with_graceful_shutdown(core::shutdown::shutdown_signal())
        .await;

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

/// One bounded drain with the configured defaults, then exit. Suited to a
/// cron job or a scheduled container.
pub async fn run_drain() -> anyhow::Result<()> {
    let state = bootstrap().await?;
    let controller = state.drain_controller().with_shutdown(core::shutdown::watch_shutdown());
    let policy = *controller.policy();

    let result = controller.drain(policy.default_limit, policy.default_rounds).await;

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    let summary = result?;
    tracing::info!(
        claimed = summary.claimed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        stopped = ?summary.stopped,
        "Drain run complete"
    );

    Ok(())
}
