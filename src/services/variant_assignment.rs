use rand::Rng;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::core::metrics;
use crate::core::state::AppState;
use crate::db::models::{ExamSession, Project};
use crate::db::types::SessionStatus;
use crate::repositories::NewSession;
use crate::services::errors::ExamError;
use crate::services::exam_window::{check_access, compute_deadline};
use crate::services::question_bank::VariantQuestionSet;

#[derive(Debug)]
pub(crate) struct StartedSession {
    pub(crate) session: ExamSession,
    pub(crate) questions: VariantQuestionSet,
    pub(crate) resumed: bool,
}

/// Returns the student's single attempt for the project, creating and
/// starting it on first call. Concurrent calls converge on one session.
pub(crate) async fn start_or_resume(
    state: &AppState,
    project_id: &str,
    student_id: &str,
    email: &str,
    now: PrimitiveDateTime,
) -> Result<StartedSession, ExamError> {
    let project =
        state.store().find_project(project_id).await?.ok_or(ExamError::NotFound("Project"))?;
    if !project.allows_email(email) {
        return Err(ExamError::NotAllowlisted);
    }

    if let Some(existing) = state.store().find_session_for_student(project_id, student_id).await? {
        return continue_session(state, &project, existing, now).await;
    }

    check_access(&project, now)?;
    ensure_capacity(state).await?;

    let variant_number = rand::thread_rng().gen_range(1..=project.variant_count.max(1));
    let claim = state
        .store()
        .create_session_if_absent(NewSession {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            student_id: student_id.to_string(),
            student_email: email.trim().to_string(),
            variant_number,
            created_at: now,
        })
        .await?;

    if !claim.inserted {
        tracing::debug!(
            project_id,
            student_id,
            session_id = %claim.session.id,
            "Concurrent start converged on the existing session"
        );
        return continue_session(state, &project, claim.session, now).await;
    }

    let started = begin(state, &project, claim.session, now).await?;
    metrics::session_started("created");
    tracing::info!(
        project_id,
        student_id,
        session_id = %started.session.id,
        variant_number = started.session.variant_number,
        deadline_at = ?started.session.deadline_at,
        "Exam session started"
    );
    Ok(started)
}

async fn continue_session(
    state: &AppState,
    project: &Project,
    session: ExamSession,
    now: PrimitiveDateTime,
) -> Result<StartedSession, ExamError> {
    match session.status {
        SessionStatus::Completed | SessionStatus::Graded => Err(ExamError::AlreadySubmitted),
        SessionStatus::InProgress => {
            let questions =
                VariantQuestionSet::load(state.store(), &project.id, session.variant_number).await?;
            state.auto_submit().arm(state, &session);
            metrics::session_started("resumed");
            Ok(StartedSession { session, questions, resumed: true })
        }
        SessionStatus::NotStarted => {
            check_access(project, now)?;
            ensure_capacity(state).await?;
            let started = begin(state, project, session, now).await?;
            metrics::session_started("created");
            Ok(started)
        }
    }
}

async fn begin(
    state: &AppState,
    project: &Project,
    session: ExamSession,
    now: PrimitiveDateTime,
) -> Result<StartedSession, ExamError> {
    // Loaded first, so a missing variant leaves the session not started.
    let questions =
        VariantQuestionSet::load(state.store(), &project.id, session.variant_number).await?;
    let deadline_at = compute_deadline(project, now);

    let current = state.store().begin_session(&session.id, now, deadline_at).await?;
    let session = match current {
        Some(current) if current.status == SessionStatus::InProgress => current,
        Some(current) if current.status.is_terminal() => return Err(ExamError::AlreadySubmitted),
        _ => {
            tracing::error!(
                project_id = %project.id,
                student_id = %session.student_id,
                session_id = %session.id,
                "Session slot did not start after create-if-absent"
            );
            return Err(ExamError::DuplicateSessionAttempt {
                project_id: project.id.clone(),
                student_id: session.student_id,
            });
        }
    };

    state.auto_submit().arm(state, &session);
    let resumed = session.started_at != Some(now);
    Ok(StartedSession { session, questions, resumed })
}

async fn ensure_capacity(state: &AppState) -> Result<(), ExamError> {
    let max = state.settings().exam().max_concurrent_sessions;
    let open = state.store().count_in_progress().await?;
    if u64::try_from(open).unwrap_or(0) >= max {
        tracing::warn!(open, max, "Rejecting new exam session at capacity");
        metrics::session_started("at_capacity");
        return Err(ExamError::AtCapacity);
    }
    Ok(())
}
