use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use time::Duration;

use crate::api::errors::ApiError;
use crate::api::guards::{CurrentStudent, CurrentUser};
use crate::core::state::AppState;
use crate::core::time::{format_primitive, primitive_now_utc, seconds_until};
use crate::db::models::ExamSession;
use crate::db::types::{FinalizeMode, SessionStatus, UserRole};
use crate::repositories::SaveOutcome;
use crate::schemas::session::{
    AnswerView, AnswersSave, AnswersSaved, SessionDetailResponse, SessionResponse, SubmitResponse,
};
use crate::services::errors::ExamError;
use crate::services::grading::FinalizeOutcome;
use crate::services::question_bank::VariantQuestionSet;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:session_id", get(get_session))
        .route("/:session_id/answers", put(save_answers))
        .route("/:session_id/submit", post(submit_session))
}

async fn load_owned_session(
    state: &AppState,
    session_id: &str,
    student_id: &str,
) -> Result<ExamSession, ApiError> {
    let session = state
        .store()
        .find_session(session_id)
        .await
        .map_err(ExamError::from)?
        .ok_or(ExamError::NotFound("Session"))?;
    if session.student_id != student_id {
        return Err(ApiError::Forbidden("Not your session"));
    }
    Ok(session)
}

async fn save_answers(
    Path(session_id): Path<String>,
    CurrentStudent(student): CurrentStudent,
    State(state): State<AppState>,
    Json(payload): Json<AnswersSave>,
) -> Result<Json<AnswersSaved>, ApiError> {
    let session = load_owned_session(&state, &session_id, &student.id).await?;

    let interval = state.settings().exam().answer_save_interval_seconds;
    let rate_key = format!("answers:{session_id}");
    if !state.redis().rate_limit(&rate_key, 1, interval).await.unwrap_or(true) {
        return Err(ApiError::TooManyRequests("Answers are saved too often"));
    }

    let now = primitive_now_utc();
    let open = session.status == SessionStatus::InProgress
        && session.deadline_at.is_some_and(|deadline| now < deadline);
    if !open {
        return Err(ExamError::SessionNotActive.into());
    }

    let set =
        VariantQuestionSet::load(state.store(), &session.project_id, session.variant_number).await?;
    if let Some(unknown) = payload.answers.iter().find(|answer| set.question(&answer.question_id).is_none())
    {
        return Err(ExamError::UnknownQuestion(unknown.question_id.clone()).into());
    }

    let saved = payload.answers.len();
    let values =
        payload.answers.into_iter().map(|answer| (answer.question_id, answer.value)).collect();
    let session = match state.store().save_answers(&session_id, values, now).await.map_err(ExamError::from)? {
        Some(SaveOutcome::Saved(session)) => session,
        Some(SaveOutcome::Rejected(_)) => return Err(ExamError::SessionNotActive.into()),
        None => return Err(ExamError::NotFound("Session").into()),
    };

    tracing::debug!(session_id = %session.id, saved, "Answers saved");
    Ok(Json(AnswersSaved {
        session_id: session.id,
        saved,
        saved_at: format_primitive(now),
        remaining_seconds: session.deadline_at.map(|deadline| seconds_until(now, deadline)),
    }))
}

async fn submit_session(
    Path(session_id): Path<String>,
    CurrentStudent(student): CurrentStudent,
    State(state): State<AppState>,
    body: Option<Json<AnswersSave>>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let session = load_owned_session(&state, &session_id, &student.id).await?;
    let now = primitive_now_utc();

    if session.status.is_terminal() {
        return Ok(Json(SubmitResponse {
            session: SessionResponse::from_session(session, now),
            submitted_now: false,
        }));
    }
    if session.status == SessionStatus::NotStarted {
        return Err(ExamError::SessionNotActive.into());
    }

    let grace = Duration::seconds(
        i64::try_from(state.settings().exam().submit_grace_seconds).unwrap_or(i64::MAX / 2),
    );
    let mode = match session.deadline_at {
        Some(deadline) if now > deadline + grace => FinalizeMode::AutoDeadline,
        _ => FinalizeMode::ManualSubmit,
    };

    let mut final_answers: Vec<(String, serde_json::Value)> = body
        .map(|Json(payload)| {
            payload.answers.into_iter().map(|answer| (answer.question_id, answer.value)).collect()
        })
        .unwrap_or_default();
    if mode == FinalizeMode::AutoDeadline && !final_answers.is_empty() {
        tracing::warn!(
            session_id,
            student_id = %student.id,
            dropped = final_answers.len(),
            "Answers submitted after the deadline were not stored"
        );
        final_answers.clear();
    }

    let outcome =
        state.grading().finalize_with_answers(&session_id, mode, final_answers, now).await?;
    state.auto_submit().cancel(&session_id);

    let submitted_now = matches!(outcome, FinalizeOutcome::Finalized(_));
    if submitted_now {
        tracing::info!(
            session_id,
            student_id = %student.id,
            mode = mode.as_str(),
            "Session submitted"
        );
    }

    Ok(Json(SubmitResponse {
        session: SessionResponse::from_session(outcome.into_session(), now),
        submitted_now,
    }))
}

async fn get_session(
    Path(session_id): Path<String>,
    CurrentUser(user): CurrentUser,
    State(state): State<AppState>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let session = state
        .store()
        .find_session(&session_id)
        .await
        .map_err(ExamError::from)?
        .ok_or(ExamError::NotFound("Session"))?;

    let allowed = match user.role {
        UserRole::Student => session.student_id == user.id,
        UserRole::Teacher => state
            .store()
            .find_project(&session.project_id)
            .await
            .map_err(ExamError::from)?
            .is_some_and(|project| project.owner_id == user.id),
    };
    if !allowed {
        return Err(ApiError::Forbidden("Not allowed to view this session"));
    }

    let set =
        VariantQuestionSet::load(state.store(), &session.project_id, session.variant_number).await?;
    let answers = state.store().list_answers(&session.id).await.map_err(ExamError::from)?;

    Ok(Json(SessionDetailResponse {
        questions: set.student_view(),
        answers: answers.into_iter().map(AnswerView::from).collect(),
        session: SessionResponse::from_session(session, primitive_now_utc()),
    }))
}
