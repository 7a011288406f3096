use std::sync::Arc;

use time::PrimitiveDateTime;

use crate::core::metrics;
use crate::db::models::{Answer, ExamSession};
use crate::db::types::FinalizeMode;
use crate::repositories::{AnswerResolution, CompletionWrite, ExamStore};
use crate::services::answer_grading;
use crate::services::errors::ExamError;
use crate::services::question_bank::VariantQuestionSet;

#[derive(Debug, Clone)]
pub(crate) enum FinalizeOutcome {
    Finalized(ExamSession),
    /// Another finalizer (submit, timer, project close) won the race.
    AlreadyFinalized(ExamSession),
}

impl FinalizeOutcome {
    pub(crate) fn session(&self) -> &ExamSession {
        match self {
            Self::Finalized(session) | Self::AlreadyFinalized(session) => session,
        }
    }

    pub(crate) fn into_session(self) -> ExamSession {
        match self {
            Self::Finalized(session) | Self::AlreadyFinalized(session) => session,
        }
    }
}

/// Turns an attempt into a score: objective answers at finalization, open
/// answers as the async grader resolves them.
#[derive(Clone)]
pub(crate) struct GradingCoordinator {
    store: Arc<dyn ExamStore>,
}

impl GradingCoordinator {
    pub(crate) fn new(store: Arc<dyn ExamStore>) -> Self {
        Self { store }
    }

    pub(crate) async fn finalize(
        &self,
        session_id: &str,
        mode: FinalizeMode,
        now: PrimitiveDateTime,
    ) -> Result<FinalizeOutcome, ExamError> {
        self.finalize_with_answers(session_id, mode, Vec::new(), now).await
    }

    /// Finalizes after writing `final_answers` in the same slot write. Every
    /// answer must belong to the session's variant.
    pub(crate) async fn finalize_with_answers(
        &self,
        session_id: &str,
        mode: FinalizeMode,
        final_answers: Vec<(String, serde_json::Value)>,
        now: PrimitiveDateTime,
    ) -> Result<FinalizeOutcome, ExamError> {
        let session =
            self.store.find_session(session_id).await?.ok_or(ExamError::NotFound("Session"))?;
        if session.status.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyFinalized(session));
        }

        let set = match VariantQuestionSet::load(
            self.store.as_ref(),
            &session.project_id,
            session.variant_number,
        )
        .await
        {
            Ok(set) => set,
            Err(err @ ExamError::VariantDataMissing { .. }) => {
                tracing::error!(
                    session_id,
                    project_id = %session.project_id,
                    variant_number = session.variant_number,
                    mode = mode.as_str(),
                    "Cannot finalize session without its variant questions"
                );
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if let Some((unknown, _)) =
            final_answers.iter().find(|(question_id, _)| set.question(question_id).is_none())
        {
            return Err(ExamError::UnknownQuestion(unknown.clone()));
        }

        let grade = |answers: &[Answer]| answer_grading::grade_session(&set, answers);
        let written = self
            .store
            .complete_session(session_id, mode, final_answers, now, &grade)
            .await?
            .ok_or(ExamError::NotFound("Session"))?;

        let completed = match written {
            CompletionWrite::AlreadyFinal(session) => {
                return Ok(FinalizeOutcome::AlreadyFinalized(session));
            }
            CompletionWrite::Applied(session) => session,
        };

        metrics::session_finalized(mode.as_str());
        let refreshed =
            self.store.refresh_session_score(&completed.id, now).await?.unwrap_or(completed);

        tracing::info!(
            session_id = %refreshed.id,
            project_id = %refreshed.project_id,
            student_id = %refreshed.student_id,
            mode = mode.as_str(),
            status = refreshed.status.as_str(),
            score = refreshed.score,
            max_score = refreshed.max_score,
            "Session finalized"
        );

        Ok(FinalizeOutcome::Finalized(refreshed))
    }

    /// Applies an async grade to a still-pending answer. `None` when the answer
    /// was already resolved.
    pub(crate) async fn resolve(
        &self,
        session_id: &str,
        question_id: &str,
        resolution: AnswerResolution,
    ) -> Result<Option<ExamSession>, ExamError> {
        let Some(session) = self.store.resolve_answer(session_id, question_id, resolution).await?
        else {
            return Ok(None);
        };

        tracing::info!(
            session_id,
            question_id,
            status = session.status.as_str(),
            score = session.score,
            "Pending answer resolved"
        );
        Ok(Some(session))
    }

    /// Finalizes every open attempt of a project that has been completed.
    pub(crate) async fn close_project(
        &self,
        project_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<usize, ExamError> {
        let sessions = self.store.list_sessions_by_project(project_id).await?;
        let mut finalized = 0;

        for session in sessions.iter().filter(|session| !session.status.is_terminal()) {
            match self.finalize(&session.id, FinalizeMode::ProjectClosed, now).await {
                Ok(FinalizeOutcome::Finalized(_)) => finalized += 1,
                Ok(FinalizeOutcome::AlreadyFinalized(_)) => {}
                Err(err) => tracing::error!(
                    project_id,
                    session_id = %session.id,
                    error = %err,
                    "Failed to finalize session on project close"
                ),
            }
        }

        tracing::info!(project_id, finalized, "Project sessions closed");
        Ok(finalized)
    }
}
