use time::PrimitiveDateTime;

use crate::db::models::ExamSession;
use crate::db::types::{FinalizeMode, SessionStatus};
use crate::repositories::NewSession;

pub(crate) const COLUMNS: &str = "\
    id, project_id, student_id, student_email, variant_number, status, started_at, \
    deadline_at, submitted_at, finalized_by, score, max_score, created_at, updated_at";

/// Serializes every writer on one (project, student) slot for the rest of the transaction.
pub(crate) async fn acquire_slot_lock(
    executor: impl sqlx::PgExecutor<'_>,
    project_id: &str,
    student_id: &str,
) -> Result<(), sqlx::Error> {
    let key = format!("exam-slot:{project_id}:{student_id}");
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))").bind(key).execute(executor).await?;
    Ok(())
}

pub(crate) async fn find_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!("SELECT {COLUMNS} FROM exam_sessions WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn lock_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "SELECT {COLUMNS} FROM exam_sessions WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn find_for_student(
    executor: impl sqlx::PgExecutor<'_>,
    project_id: &str,
    student_id: &str,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "SELECT {COLUMNS} FROM exam_sessions WHERE project_id = $1 AND student_id = $2"
    ))
    .bind(project_id)
    .bind(student_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn create(
    executor: impl sqlx::PgExecutor<'_>,
    session: &NewSession,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO exam_sessions (
            id, project_id, student_id, student_email, variant_number, status,
            created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$7)
        ON CONFLICT (project_id, student_id) DO NOTHING",
    )
    .bind(&session.id)
    .bind(&session.project_id)
    .bind(&session.student_id)
    .bind(&session.student_email)
    .bind(session.variant_number)
    .bind(SessionStatus::NotStarted)
    .bind(session.created_at)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn begin(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    started_at: PrimitiveDateTime,
    deadline_at: PrimitiveDateTime,
) -> Result<Option<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "UPDATE exam_sessions
         SET status = $2, started_at = $3, deadline_at = $4, updated_at = $3
         WHERE id = $1 AND status = $5
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(SessionStatus::InProgress)
    .bind(started_at)
    .bind(deadline_at)
    .bind(SessionStatus::NotStarted)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn count_in_progress(
    executor: impl sqlx::PgExecutor<'_>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM exam_sessions WHERE status = $1")
        .bind(SessionStatus::InProgress)
        .fetch_one(executor)
        .await
}

pub(crate) async fn list_by_project(
    executor: impl sqlx::PgExecutor<'_>,
    project_id: &str,
) -> Result<Vec<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "SELECT {COLUMNS} FROM exam_sessions WHERE project_id = $1 ORDER BY created_at, id"
    ))
    .bind(project_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn list_in_progress(
    executor: impl sqlx::PgExecutor<'_>,
) -> Result<Vec<ExamSession>, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "SELECT {COLUMNS} FROM exam_sessions WHERE status = $1 ORDER BY deadline_at"
    ))
    .bind(SessionStatus::InProgress)
    .fetch_all(executor)
    .await
}

pub(crate) async fn mark_completed(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    mode: FinalizeMode,
    score: f64,
    max_score: f64,
    now: PrimitiveDateTime,
) -> Result<ExamSession, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "UPDATE exam_sessions
         SET status = $2, finalized_by = $3, submitted_at = $4, score = $5,
             max_score = $6, updated_at = $4
         WHERE id = $1
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(SessionStatus::Completed)
    .bind(mode)
    .bind(now)
    .bind(score)
    .bind(max_score)
    .fetch_one(executor)
    .await
}

pub(crate) async fn update_score(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    score: f64,
    status: SessionStatus,
    now: PrimitiveDateTime,
) -> Result<ExamSession, sqlx::Error> {
    sqlx::query_as::<_, ExamSession>(&format!(
        "UPDATE exam_sessions SET score = $2, status = $3, updated_at = $4
         WHERE id = $1
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(score)
    .bind(status)
    .bind(now)
    .fetch_one(executor)
    .await
}
