use sqlx::types::Json;
use time::PrimitiveDateTime;

use crate::db::models::Project;
use crate::db::types::ProjectStatus;
use crate::repositories::{NewProject, ProjectWindow};

pub(crate) const COLUMNS: &str = "\
    id, owner_id, title, status, start_time, end_time, total_time_minutes, \
    variant_count, max_students, allowed_student_emails, created_at, updated_at";

pub(crate) async fn create(
    executor: impl sqlx::PgExecutor<'_>,
    project: &NewProject,
) -> Result<Project, sqlx::Error> {
    sqlx::query_as::<_, Project>(&format!(
        "INSERT INTO projects (
            id, owner_id, title, status, start_time, end_time, total_time_minutes,
            variant_count, max_students, allowed_student_emails, created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$11)
        RETURNING {COLUMNS}"
    ))
    .bind(&project.id)
    .bind(&project.owner_id)
    .bind(&project.title)
    .bind(ProjectStatus::Draft)
    .bind(project.start_time)
    .bind(project.end_time)
    .bind(project.total_time_minutes)
    .bind(project.variant_count)
    .bind(project.max_students)
    .bind(Json(&project.allowed_student_emails))
    .bind(project.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
) -> Result<Option<Project>, sqlx::Error> {
    sqlx::query_as::<_, Project>(&format!("SELECT {COLUMNS} FROM projects WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn lock_for_update(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
) -> Result<Option<Project>, sqlx::Error> {
    sqlx::query_as::<_, Project>(&format!(
        "SELECT {COLUMNS} FROM projects WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn transition_status(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    from: ProjectStatus,
    to: ProjectStatus,
    window: Option<ProjectWindow>,
    now: PrimitiveDateTime,
) -> Result<Option<Project>, sqlx::Error> {
    sqlx::query_as::<_, Project>(&format!(
        "UPDATE projects
         SET status = $3, updated_at = $4,
             start_time = COALESCE($5, start_time), end_time = COALESCE($6, end_time)
         WHERE id = $1 AND status = $2
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(from)
    .bind(to)
    .bind(now)
    .bind(window.map(|w| w.start_time))
    .bind(window.map(|w| w.end_time))
    .fetch_optional(executor)
    .await
}

pub(crate) async fn list_past_end(
    executor: impl sqlx::PgExecutor<'_>,
    now: PrimitiveDateTime,
) -> Result<Vec<Project>, sqlx::Error> {
    sqlx::query_as::<_, Project>(&format!(
        "SELECT {COLUMNS} FROM projects
         WHERE status IN ($1, $2) AND end_time IS NOT NULL AND end_time <= $3
         ORDER BY end_time"
    ))
    .bind(ProjectStatus::Ready)
    .bind(ProjectStatus::Active)
    .bind(now)
    .fetch_all(executor)
    .await
}
