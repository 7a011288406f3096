use sqlx::types::Json;
use time::PrimitiveDateTime;

use crate::db::models::Answer;
use crate::db::types::GradingStatus;
use crate::repositories::{AnswerGrade, AnswerResolution};

pub(crate) const COLUMNS: &str = "\
    session_id, question_id, value, is_correct, score, grading_status, feedback, \
    grading_attempts, next_grading_at, answered_at, graded_at";

pub(crate) async fn upsert_value(
    executor: impl sqlx::PgExecutor<'_>,
    session_id: &str,
    question_id: &str,
    value: &serde_json::Value,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO answers (session_id, question_id, value, answered_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (session_id, question_id)
         DO UPDATE SET value = EXCLUDED.value, answered_at = EXCLUDED.answered_at",
    )
    .bind(session_id)
    .bind(question_id)
    .bind(Json(value))
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn list_by_session(
    executor: impl sqlx::PgExecutor<'_>,
    session_id: &str,
) -> Result<Vec<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "SELECT {COLUMNS} FROM answers WHERE session_id = $1 ORDER BY question_id"
    ))
    .bind(session_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn apply_grade(
    executor: impl sqlx::PgExecutor<'_>,
    session_id: &str,
    grade: &AnswerGrade,
    now: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    let graded_at = (grade.grading_status == GradingStatus::Graded).then_some(now);
    let next_grading_at = (grade.grading_status == GradingStatus::Pending).then_some(now);

    sqlx::query(
        "UPDATE answers
         SET grading_status = $3, is_correct = $4, score = $5, graded_at = $6,
             next_grading_at = $7
         WHERE session_id = $1 AND question_id = $2",
    )
    .bind(session_id)
    .bind(&grade.question_id)
    .bind(grade.grading_status)
    .bind(grade.is_correct)
    .bind(grade.score)
    .bind(graded_at)
    .bind(next_grading_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn claim_due(
    executor: impl sqlx::PgExecutor<'_>,
    limit: i64,
    now: PrimitiveDateTime,
    lease_until: PrimitiveDateTime,
) -> Result<Vec<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "WITH due AS (
            SELECT session_id, question_id FROM answers
            WHERE grading_status = $1 AND next_grading_at <= $2
            ORDER BY next_grading_at
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        )
        UPDATE answers AS a SET next_grading_at = $4
        FROM due
        WHERE a.session_id = due.session_id AND a.question_id = due.question_id
        RETURNING {}",
        prefixed_columns("a")
    ))
    .bind(GradingStatus::Pending)
    .bind(now)
    .bind(limit)
    .bind(lease_until)
    .fetch_all(executor)
    .await
}

pub(crate) async fn resolve_pending(
    executor: impl sqlx::PgExecutor<'_>,
    session_id: &str,
    question_id: &str,
    resolution: &AnswerResolution,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE answers
         SET grading_status = $3, is_correct = $4, score = $5, feedback = $6,
             graded_at = $7, next_grading_at = NULL, grading_attempts = grading_attempts + 1
         WHERE session_id = $1 AND question_id = $2 AND grading_status = $8",
    )
    .bind(session_id)
    .bind(question_id)
    .bind(GradingStatus::Graded)
    .bind(resolution.is_correct)
    .bind(resolution.score)
    .bind(&resolution.feedback)
    .bind(resolution.graded_at)
    .bind(GradingStatus::Pending)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn defer_pending(
    executor: impl sqlx::PgExecutor<'_>,
    session_id: &str,
    question_id: &str,
    next_attempt_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE answers
         SET grading_attempts = grading_attempts + 1, next_grading_at = $3
         WHERE session_id = $1 AND question_id = $2 AND grading_status = $4",
    )
    .bind(session_id)
    .bind(question_id)
    .bind(next_attempt_at)
    .bind(GradingStatus::Pending)
    .execute(executor)
    .await?;
    Ok(())
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS.split(',').map(|column| format!("{alias}.{}", column.trim())).collect::<Vec<_>>().join(", ")
}
