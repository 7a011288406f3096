use anyhow::{Context, Result};
use time::{Duration, PrimitiveDateTime};

use crate::core::state::AppState;
use crate::db::types::ProjectStatus;
use crate::services::auto_submit;

/// Finalizes attempts whose deadline plus grace passed without a timer
/// firing, e.g. after a restart of the process that owned the timer.
pub(crate) async fn finalize_overdue_sessions(
    state: &AppState,
    now: PrimitiveDateTime,
) -> Result<usize> {
    let grace = Duration::seconds(
        i64::try_from(state.settings().exam().submit_grace_seconds).unwrap_or(0),
    );
    let sessions = state
        .store()
        .list_in_progress_sessions()
        .await
        .context("Failed to fetch in-progress sessions")?;

    let mut overdue = 0;
    for session in sessions {
        let Some(deadline) = session.deadline_at else {
            continue;
        };
        if deadline + grace > now {
            continue;
        }

        auto_submit::fire(state, &session.id, &session.project_id, &session.student_id, now).await;
        state.auto_submit().cancel(&session.id);
        overdue += 1;
    }

    if overdue > 0 {
        tracing::info!(overdue, "Finalized overdue sessions");
    }
    Ok(overdue)
}

/// Completes projects whose end time passed and closes their open attempts.
pub(crate) async fn complete_ended_projects(
    state: &AppState,
    now: PrimitiveDateTime,
) -> Result<usize> {
    let projects = state
        .store()
        .list_projects_past_end(now)
        .await
        .context("Failed to fetch ended projects")?;

    let mut completed = 0;
    for project in projects {
        let Some(updated) = state
            .store()
            .transition_project(&project.id, project.status, ProjectStatus::Completed, None, now)
            .await
            .context("Failed to complete project")?
        else {
            continue;
        };

        let closed = state
            .grading()
            .close_project(&updated.id, now)
            .await
            .with_context(|| format!("Failed to close sessions of project {}", updated.id))?;
        tracing::info!(
            project_id = %updated.id,
            from = project.status.as_str(),
            closed,
            "Project completed at end time"
        );
        completed += 1;
    }

    Ok(completed)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::db::types::{FinalizeMode, QuestionType, SessionStatus};
    use crate::repositories::{NewSession, ProjectWindow};
    use crate::test_support::{build_memory_state, create_project_with_variants, question};

    const NOW: PrimitiveDateTime = datetime!(2025-05-01 10:00:00);

    async fn started(state: &AppState, id: &str, student: &str, deadline: PrimitiveDateTime) {
        let claim = state
            .store()
            .create_session_if_absent(NewSession {
                id: id.into(),
                project_id: "p1".into(),
                student_id: student.into(),
                student_email: format!("{student}@example.com"),
                variant_number: 1,
                created_at: NOW - Duration::hours(1),
            })
            .await
            .unwrap();
        state.store().begin_session(&claim.session.id, NOW - Duration::hours(1), deadline).await.unwrap();
    }

    async fn project(state: &AppState) {
        create_project_with_variants(
            state.store(),
            "p1",
            vec![question("p1", 1, 0, QuestionType::SingleChoice, 1.0)],
        )
        .await;
    }

    #[tokio::test]
    async fn only_sessions_past_grace_are_finalized() {
        let state = build_memory_state();
        project(&state).await;
        // grace defaults to 30 seconds
        started(&state, "overdue", "u1", NOW - Duration::minutes(1)).await;
        started(&state, "in-grace", "u2", NOW - Duration::seconds(10)).await;
        started(&state, "running", "u3", NOW + Duration::minutes(10)).await;

        assert_eq!(finalize_overdue_sessions(&state, NOW).await.unwrap(), 1);

        let overdue = state.store().find_session("overdue").await.unwrap().unwrap();
        // no answers, so nothing is left pending
        assert_eq!(overdue.status, SessionStatus::Graded);
        assert_eq!(overdue.finalized_by, Some(FinalizeMode::AutoDeadline));
        for id in ["in-grace", "running"] {
            let session = state.store().find_session(id).await.unwrap().unwrap();
            assert_eq!(session.status, SessionStatus::InProgress);
        }

        assert_eq!(finalize_overdue_sessions(&state, NOW).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ended_projects_close_their_attempts() {
        let state = build_memory_state();
        project(&state).await;
        let store = state.store();
        store
            .transition_project("p1", ProjectStatus::Draft, ProjectStatus::Ready, None, NOW)
            .await
            .unwrap()
            .unwrap();
        store
            .transition_project(
                "p1",
                ProjectStatus::Ready,
                ProjectStatus::Active,
                Some(ProjectWindow { start_time: NOW - Duration::hours(2), end_time: NOW }),
                NOW - Duration::hours(2),
            )
            .await
            .unwrap()
            .unwrap();
        started(&state, "open", "u1", NOW + Duration::minutes(30)).await;

        assert_eq!(complete_ended_projects(&state, NOW - Duration::minutes(1)).await.unwrap(), 0);
        assert_eq!(complete_ended_projects(&state, NOW).await.unwrap(), 1);

        let project = store.find_project("p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Completed);
        let session = store.find_session("open").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Graded);
        assert_eq!(session.finalized_by, Some(FinalizeMode::ProjectClosed));

        assert_eq!(complete_ended_projects(&state, NOW).await.unwrap(), 0);
    }
}
