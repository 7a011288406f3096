use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::PrimitiveDateTime;
use tokio::task::JoinHandle;

use crate::core::metrics;
use crate::core::state::AppState;
use crate::core::time::{primitive_now_utc, std_duration_until};
use crate::db::models::ExamSession;
use crate::db::types::{FinalizeMode, SessionStatus};
use crate::schemas::lobby::ServerEvent;
use crate::services::errors::ExamError;
use crate::services::grading::FinalizeOutcome;

/// One deadline timer per in-progress session.
#[derive(Clone, Default)]
pub(crate) struct AutoSubmitScheduler {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl AutoSubmitScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms the timer for `session.deadline_at`. A live timer for the same
    /// session is kept as is.
    pub(crate) fn arm(&self, state: &AppState, session: &ExamSession) -> bool {
        if session.status != SessionStatus::InProgress {
            return false;
        }
        let Some(deadline) = session.deadline_at else {
            return false;
        };

        let mut timers = self.timers();
        if timers.get(&session.id).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let delay = std_duration_until(primitive_now_utc(), deadline);
        let task_state = state.clone();
        let session_id = session.id.clone();
        let project_id = session.project_id.clone();
        let student_id = session.student_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(&task_state, &session_id, &project_id, &student_id, primitive_now_utc()).await;
            task_state.auto_submit().forget(&session_id);
        });
        timers.insert(session.id.clone(), handle);

        tracing::debug!(
            session_id = %session.id,
            deadline_at = %deadline,
            delay_seconds = delay.as_secs(),
            "Auto-submit timer armed"
        );
        true
    }

    /// Best effort: a timer that already fired loses the finalize race anyway.
    pub(crate) fn cancel(&self, session_id: &str) {
        if let Some(handle) = self.timers().remove(session_id) {
            handle.abort();
        }
    }

    // Called from the timer task itself; `arm` never replaces a running
    // timer, so the entry is still ours.
    fn forget(&self, session_id: &str) {
        self.timers().remove(session_id);
    }

    pub(crate) fn armed(&self) -> usize {
        self.timers().values().filter(|handle| !handle.is_finished()).count()
    }

    /// Re-arms every in-progress session, e.g. after a restart.
    pub(crate) async fn rearm_open_sessions(&self, state: &AppState) -> Result<usize, ExamError> {
        let sessions = state.store().list_in_progress_sessions().await?;
        let armed = sessions.iter().filter(|session| self.arm(state, session)).count();
        tracing::info!(armed, open = sessions.len(), "Auto-submit timers restored");
        Ok(armed)
    }

    pub(crate) fn shutdown(&self) {
        for (_, handle) in self.timers().drain() {
            handle.abort();
        }
    }
}

/// Deadline finalization shared by the timer and the maintenance sweep.
pub(crate) async fn fire(
    state: &AppState,
    session_id: &str,
    project_id: &str,
    student_id: &str,
    now: PrimitiveDateTime,
) {
    match state.grading().finalize(session_id, FinalizeMode::AutoDeadline, now).await {
        Ok(FinalizeOutcome::Finalized(_)) => {
            metrics::auto_submit_fired("finalized");
            let delivered = state.lobby().notify_student(
                project_id,
                student_id,
                ServerEvent::ExamTimeExpired {
                    project_id: project_id.to_string(),
                    session_id: session_id.to_string(),
                },
            );
            tracing::info!(session_id, project_id, student_id, delivered, "Session auto-submitted");
        }
        Ok(FinalizeOutcome::AlreadyFinalized(_)) => {
            metrics::auto_submit_fired("noop");
            tracing::debug!(session_id, "Auto-submit found session already finalized");
        }
        Err(err) => {
            metrics::auto_submit_fired("error");
            tracing::error!(session_id, project_id, error = %err, "Auto-submit failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::db::types::QuestionType;
    use crate::repositories::NewSession;
    use crate::test_support::{build_memory_state, create_project_with_variants, question};

    async fn open_session(state: &AppState, deadline: PrimitiveDateTime) -> ExamSession {
        create_project_with_variants(
            state.store(),
            "p1",
            vec![question("p1", 1, 0, QuestionType::ShortAnswer, 4.0)],
        )
        .await;
        let claim = state
            .store()
            .create_session_if_absent(NewSession {
                id: "sess-1".into(),
                project_id: "p1".into(),
                student_id: "u1".into(),
                student_email: "u1@example.com".into(),
                variant_number: 1,
                created_at: datetime!(2025-05-01 09:00:00),
            })
            .await
            .unwrap();
        state
            .store()
            .begin_session(&claim.session.id, datetime!(2025-05-01 09:00:00), deadline)
            .await
            .unwrap()
            .unwrap()
    }

    async fn wait_for_terminal(state: &AppState, session_id: &str) -> ExamSession {
        for _ in 0..100 {
            let session = state.store().find_session(session_id).await.unwrap().unwrap();
            if session.status.is_terminal() {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {session_id} was not finalized");
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately_and_notifies_student() {
        let state = build_memory_state();
        let session = open_session(&state, datetime!(2025-05-01 09:30:00)).await;
        let project = state.store().find_project("p1").await.unwrap().unwrap();
        let mut ticket = state.lobby().join(&project, "u1", "u1@example.com", primitive_now_utc()).unwrap();

        assert!(state.auto_submit().arm(&state, &session));
        let done = wait_for_terminal(&state, &session.id).await;

        assert_eq!(done.finalized_by, Some(FinalizeMode::AutoDeadline));
        let signal = tokio::time::timeout(Duration::from_secs(1), ticket.signals.recv()).await.unwrap();
        assert!(matches!(
            signal,
            Some(crate::services::lobby::StudentSignal::Event(ServerEvent::ExamTimeExpired { .. }))
        ));
    }

    #[tokio::test]
    async fn rearming_is_a_no_op_and_manual_submit_wins() {
        let state = build_memory_state();
        let session = open_session(&state, datetime!(2999-01-01 00:00:00)).await;
        state.store().save_answers(&session.id, vec![("q".into(), json!("x"))], primitive_now_utc()).await.unwrap();

        assert!(state.auto_submit().arm(&state, &session));
        assert!(!state.auto_submit().arm(&state, &session));
        assert_eq!(state.auto_submit().armed(), 1);

        let outcome = state
            .grading()
            .finalize(&session.id, FinalizeMode::ManualSubmit, primitive_now_utc())
            .await
            .unwrap();
        state.auto_submit().cancel(&session.id);

        assert!(matches!(outcome, FinalizeOutcome::Finalized(_)));
        assert_eq!(state.auto_submit().armed(), 0);

        // A late timer firing is a no-op.
        fire(&state, &session.id, "p1", "u1", primitive_now_utc()).await;
        let stored = state.store().find_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.finalized_by, Some(FinalizeMode::ManualSubmit));
    }
}
