use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};

use crate::core::shutdown;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::services::ai_grading::{AiGradingService, AnswerGrader};
use crate::tasks::{grading, maintenance};

const GRADING_BATCH: i64 = 1;

/// Runs the grading pool and maintenance loops until a shutdown signal.
pub(crate) async fn run(state: AppState) -> Result<()> {
    let grader: Arc<dyn AnswerGrader> = Arc::new(AiGradingService::from_settings(state.settings())?);
    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let handles = spawn(&state, grader, shutdown_rx);

    shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }
    join(handles).await;

    Ok(())
}

pub(crate) fn spawn(
    state: &AppState,
    grader: Arc<dyn AnswerGrader>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let concurrency = state.settings().grading().worker_concurrency.max(1);
    let mut handles = Vec::with_capacity(concurrency + 1);

    for worker in 0..concurrency {
        handles.push(tokio::spawn(grading_worker(
            state.clone(),
            grader.clone(),
            worker,
            shutdown_rx.clone(),
        )));
    }
    handles.push(tokio::spawn(maintenance_loop(state.clone(), shutdown_rx)));

    tracing::info!(grading_workers = concurrency, "Background tasks started");
    handles
}

pub(crate) async fn join(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }
}

async fn grading_worker(
    state: AppState,
    grader: Arc<dyn AnswerGrader>,
    worker: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll = Duration::from_secs(state.settings().grading().poll_interval_seconds.max(1));
    loop {
        if *shutdown.borrow() {
            break;
        }

        match grading::process_due(&state, grader.as_ref(), GRADING_BATCH, primitive_now_utc()).await
        {
            Ok(pass) if pass.claimed > 0 => continue,
            Ok(_) => {}
            Err(err) => tracing::error!(worker, error = %err, "Grading pass failed"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(poll) => {}
        }
    }
}

async fn maintenance_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick =
        interval(Duration::from_secs(state.settings().grading().maintenance_interval_seconds.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let now = primitive_now_utc();
                if let Err(err) = maintenance::finalize_overdue_sessions(&state, now).await {
                    tracing::error!(error = %err, "finalize_overdue_sessions failed");
                }
                if let Err(err) = maintenance::complete_ended_projects(&state, now).await {
                    tracing::error!(error = %err, "complete_ended_projects failed");
                }
            }
        }
    }
}
