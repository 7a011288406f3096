pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;

use crate::core::config::{PersistenceBackend, Settings};
use crate::core::{redis::RedisHandle, shutdown, state::AppState, telemetry};
use crate::repositories::memory::MemoryExamStore;
use crate::repositories::postgres::PgExamStore;
use crate::repositories::ExamStore;
use crate::services::ai_grading::{AiGradingService, AnswerGrader};

async fn build_store(settings: &Settings) -> anyhow::Result<Arc<dyn ExamStore>> {
    match settings.persistence().backend {
        PersistenceBackend::Postgres => {
            let pool = db::init_pool(settings).await.context("Failed to connect to PostgreSQL")?;
            db::run_migrations(&pool).await.context("Failed to run migrations")?;
            Ok(Arc::new(PgExamStore::new(pool)))
        }
        PersistenceBackend::Memory => {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            Ok(Arc::new(MemoryExamStore::new()))
        }
    }
}

async fn build_state() -> anyhow::Result<AppState> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let store = build_store(&settings).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; rate limits fail open");
    } else {
        tracing::info!("Redis connected successfully");
    }

    Ok(AppState::new(settings, store, redis))
}

pub async fn run() -> anyhow::Result<()> {
    let state = build_state().await?;

    state.auto_submit().rearm_open_sessions(&state).await?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let background = if state.settings().persistence().backend == PersistenceBackend::Memory {
        let grader: Arc<dyn AnswerGrader> =
            Arc::new(AiGradingService::from_settings(state.settings())?);
        tasks::scheduler::spawn(&state, grader, shutdown_rx.clone())
    } else {
        Vec::new()
    };

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        addr = %state.settings().server_addr(),
        environment = %state.settings().runtime().environment.as_str(),
        backend = state.settings().persistence().backend.as_str(),
        "Exam orchestrator listening"
    );

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown::shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown::wait(shutdown_rx)).await;

    let _ = shutdown_tx.send(true);
    tasks::scheduler::join(background).await;
    state.auto_submit().shutdown();

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

pub async fn run_worker() -> anyhow::Result<()> {
    let state = build_state().await?;

    if state.settings().persistence().backend == PersistenceBackend::Memory {
        tracing::warn!(
            "Worker started with the in-memory store; it shares no state with the API process"
        );
    }

    let result = tasks::scheduler::run(state.clone()).await;

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}
