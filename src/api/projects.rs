use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::api::guards::{require_project_owner, CurrentStudent, CurrentTeacher};
use crate::api::lobby;
use crate::core::state::AppState;
use crate::core::time::{primitive_now_utc, to_primitive_utc};
use crate::repositories::NewProject;
use crate::schemas::lobby::LobbySnapshot;
use crate::schemas::project::{
    KickRequest, ProjectCreate, ProjectResponse, TransitionRequest, VariantSetsImport,
    VariantSetsImported,
};
use crate::schemas::session::{SessionResponse, StartSessionResponse};
use crate::services::errors::ExamError;
use crate::services::{exam_window, question_bank, variant_assignment};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_project))
        .route("/:project_id", get(get_project))
        .route("/:project_id/variant-sets", post(import_variant_sets))
        .route("/:project_id/transition", post(transition_project))
        .route("/:project_id/sessions", get(list_sessions))
        .route("/:project_id/sessions/start", post(start_session))
        .route("/:project_id/lobby", get(lobby_snapshot))
        .route("/:project_id/lobby/kick", post(kick_student))
        .route("/:project_id/lobby/ws", get(lobby::student_socket))
        .route("/:project_id/lobby/teacher/ws", get(lobby::teacher_socket))
}

async fn create_project(
    CurrentTeacher(teacher): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<ProjectCreate>,
) -> Result<(StatusCode, Json<ProjectResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let start_time = payload.start_time.map(to_primitive_utc);
    let end_time = payload.end_time.map(to_primitive_utc);
    if let (Some(start), Some(end)) = (start_time, end_time) {
        if end <= start {
            return Err(ApiError::BadRequest("end_time must be after start_time".to_string()));
        }
    }

    let allowed_student_emails = payload
        .allowed_student_emails
        .iter()
        .map(|email| email.trim().to_lowercase())
        .filter(|email| !email.is_empty())
        .collect::<Vec<_>>();

    let project = state
        .store()
        .create_project(NewProject {
            id: Uuid::new_v4().to_string(),
            owner_id: teacher.id.clone(),
            title: payload.title.trim().to_string(),
            start_time,
            end_time,
            total_time_minutes: payload.total_time_minutes,
            variant_count: payload.variant_count,
            max_students: payload.max_students,
            allowed_student_emails,
            created_at: primitive_now_utc(),
        })
        .await
        .map_err(ExamError::from)?;

    tracing::info!(project_id = %project.id, owner_id = %teacher.id, "Project created");
    Ok((StatusCode::CREATED, Json(project.into())))
}

async fn get_project(
    Path(project_id): Path<String>,
    CurrentTeacher(teacher): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<ProjectResponse>, ApiError> {
    let project = require_project_owner(&state, &teacher, &project_id).await?;
    Ok(Json(project.into()))
}

async fn import_variant_sets(
    Path(project_id): Path<String>,
    CurrentTeacher(teacher): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<VariantSetsImport>,
) -> Result<(StatusCode, Json<VariantSetsImported>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let project = require_project_owner(&state, &teacher, &project_id).await?;

    let question_count =
        question_bank::import_variant_sets(state.store(), &project, payload.variant_sets).await?;

    Ok((
        StatusCode::CREATED,
        Json(VariantSetsImported {
            project_id: project.id,
            variant_count: project.variant_count,
            question_count,
        }),
    ))
}

async fn transition_project(
    Path(project_id): Path<String>,
    CurrentTeacher(teacher): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<TransitionRequest>,
) -> Result<Json<ProjectResponse>, ApiError> {
    let project = require_project_owner(&state, &teacher, &project_id).await?;
    let updated =
        exam_window::transition_project(&state, &project, payload.target, primitive_now_utc())
            .await?;
    Ok(Json(updated.into()))
}

async fn list_sessions(
    Path(project_id): Path<String>,
    CurrentTeacher(teacher): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionResponse>>, ApiError> {
    require_project_owner(&state, &teacher, &project_id).await?;

    let now = primitive_now_utc();
    let sessions = state.store().list_sessions_by_project(&project_id).await.map_err(ExamError::from)?;
    Ok(Json(sessions.into_iter().map(|session| SessionResponse::from_session(session, now)).collect()))
}

async fn start_session(
    Path(project_id): Path<String>,
    CurrentStudent(student): CurrentStudent,
    State(state): State<AppState>,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let now = primitive_now_utc();
    let started =
        variant_assignment::start_or_resume(&state, &project_id, &student.id, &student.email, now)
            .await?;

    Ok(Json(StartSessionResponse {
        questions: started.questions.student_view(),
        resumed: started.resumed,
        session: SessionResponse::from_session(started.session, now),
    }))
}

async fn lobby_snapshot(
    Path(project_id): Path<String>,
    CurrentTeacher(teacher): CurrentTeacher,
    State(state): State<AppState>,
) -> Result<Json<LobbySnapshot>, ApiError> {
    require_project_owner(&state, &teacher, &project_id).await?;
    Ok(Json(state.lobby().snapshot(&project_id)))
}

async fn kick_student(
    Path(project_id): Path<String>,
    CurrentTeacher(teacher): CurrentTeacher,
    State(state): State<AppState>,
    Json(payload): Json<KickRequest>,
) -> Result<StatusCode, ApiError> {
    require_project_owner(&state, &teacher, &project_id).await?;

    if state.lobby().kick(&project_id, &payload.student_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("Student is not in the lobby".to_string()))
    }
}
