use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::Value;
use time::{Duration, PrimitiveDateTime};

use crate::core::metrics;
use crate::core::state::AppState;
use crate::db::models::Answer;
use crate::repositories::AnswerResolution;
use crate::services::ai_grading::{AnswerGrader, OpenAnswerRequest};
use crate::services::question_bank::VariantQuestionSet;

const MAX_BACKOFF_SHIFT: u32 = 16;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GradingPass {
    pub(crate) claimed: usize,
    pub(crate) graded: usize,
    pub(crate) deferred: usize,
}

/// Exponential backoff for a failed grading attempt, capped at `max_seconds`.
pub(crate) fn retry_delay(base_seconds: u64, max_seconds: u64, attempts: i32) -> Duration {
    let shift = u32::try_from(attempts).unwrap_or(0).min(MAX_BACKOFF_SHIFT);
    let seconds = base_seconds.saturating_mul(1u64 << shift).min(max_seconds);
    Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
}

fn answer_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Leases up to `limit` due answers and grades them one by one. A failed
/// grade pushes the answer back with backoff; an answer whose question
/// vanished keeps its lease and is retried once it lapses.
pub(crate) async fn process_due(
    state: &AppState,
    grader: &dyn AnswerGrader,
    limit: i64,
    now: PrimitiveDateTime,
) -> Result<GradingPass> {
    let settings = state.settings().grading();
    let lease_until = now + Duration::seconds(i64::try_from(settings.lease_seconds).unwrap_or(300));
    let claimed = state
        .store()
        .claim_pending_answers(limit, now, lease_until)
        .await
        .context("Failed to claim pending answers")?;

    let mut pass = GradingPass { claimed: claimed.len(), ..GradingPass::default() };
    let mut sets: HashMap<(String, i32), VariantQuestionSet> = HashMap::new();

    for answer in claimed {
        let Some(request) = build_request(state, &mut sets, &answer).await? else {
            metrics::grading_job("skipped");
            continue;
        };

        match grader.grade(request).await {
            Ok(grade) => {
                let resolution = AnswerResolution {
                    is_correct: grade.is_correct,
                    score: grade.score,
                    feedback: grade.feedback,
                    graded_at: now,
                };
                let resolved = state
                    .grading()
                    .resolve(&answer.session_id, &answer.question_id, resolution)
                    .await
                    .context("Failed to store async grade")?;
                if resolved.is_some() {
                    pass.graded += 1;
                    metrics::grading_job("graded");
                } else {
                    metrics::grading_job("stale");
                }
            }
            Err(err) => {
                let next_attempt_at = now
                    + retry_delay(
                        settings.retry_base_seconds,
                        settings.retry_max_seconds,
                        answer.grading_attempts,
                    );
                state
                    .store()
                    .defer_answer(&answer.session_id, &answer.question_id, next_attempt_at)
                    .await
                    .context("Failed to defer answer")?;
                pass.deferred += 1;
                metrics::grading_job("deferred");
                tracing::warn!(
                    session_id = %answer.session_id,
                    question_id = %answer.question_id,
                    attempts = answer.grading_attempts + 1,
                    error = %err,
                    "Async grading failed, retry scheduled"
                );
            }
        }
    }

    Ok(pass)
}

async fn build_request(
    state: &AppState,
    sets: &mut HashMap<(String, i32), VariantQuestionSet>,
    answer: &Answer,
) -> Result<Option<OpenAnswerRequest>> {
    let Some(session) =
        state.store().find_session(&answer.session_id).await.context("Failed to load session")?
    else {
        tracing::warn!(session_id = %answer.session_id, "Pending answer without a session");
        return Ok(None);
    };

    let key = (session.project_id.clone(), session.variant_number);
    if !sets.contains_key(&key) {
        match VariantQuestionSet::load(state.store(), &session.project_id, session.variant_number)
            .await
        {
            Ok(set) => {
                sets.insert(key.clone(), set);
            }
            Err(err) => {
                tracing::error!(
                    session_id = %session.id,
                    project_id = %session.project_id,
                    variant_number = session.variant_number,
                    error = %err,
                    "Cannot grade answer without its variant questions"
                );
                return Ok(None);
            }
        }
    }

    let Some(question) = sets.get(&key).and_then(|set| set.question(&answer.question_id)) else {
        tracing::warn!(
            session_id = %session.id,
            question_id = %answer.question_id,
            "Pending answer references an unknown question"
        );
        return Ok(None);
    };

    Ok(Some(OpenAnswerRequest {
        question_type: question.question_type,
        question_text: question.text.clone(),
        answer_text: answer_text(&answer.value.0),
        points: question.points,
        expected_keywords: question.expected_keywords.0.clone(),
        rubric: question.rubric.clone(),
    }))
}
