use async_trait::async_trait;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::{Answer, ExamSession, Project, Question};
use crate::db::types::{FinalizeMode, ProjectStatus, SessionStatus};
use crate::repositories::{
    answers, projects, questions, sessions, summarize_answers, AnswerResolution, CompletionWrite,
    ExamStore, GradeFn, NewProject, NewSession, ProjectWindow, SaveOutcome, SlotClaim, StoreError,
};

#[derive(Clone)]
pub(crate) struct PgExamStore {
    pool: PgPool,
}

impl PgExamStore {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn refresh_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        session: ExamSession,
        now: PrimitiveDateTime,
    ) -> Result<ExamSession, StoreError> {
        if !session.status.is_terminal() {
            return Ok(session);
        }

        let stored = answers::list_by_session(&mut **tx, &session.id).await?;
        let (score, pending) = summarize_answers(&stored);
        let status = if pending { SessionStatus::Completed } else { SessionStatus::Graded };

        Ok(sessions::update_score(&mut **tx, &session.id, score, status, now).await?)
    }
}

#[async_trait]
impl ExamStore for PgExamStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_project(&self, project: NewProject) -> Result<Project, StoreError> {
        Ok(projects::create(&self.pool, &project).await?)
    }

    async fn find_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        Ok(projects::find_by_id(&self.pool, project_id).await?)
    }

    async fn transition_project(
        &self,
        project_id: &str,
        from: ProjectStatus,
        to: ProjectStatus,
        window: Option<ProjectWindow>,
        now: PrimitiveDateTime,
    ) -> Result<Option<Project>, StoreError> {
        Ok(projects::transition_status(&self.pool, project_id, from, to, window, now).await?)
    }

    async fn list_projects_past_end(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Vec<Project>, StoreError> {
        Ok(projects::list_past_end(&self.pool, now).await?)
    }

    async fn insert_variant_sets(
        &self,
        project_id: &str,
        variant_questions: Vec<Question>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(project) = projects::lock_for_update(&mut *tx, project_id).await? else {
            return Ok(false);
        };
        if !matches!(project.status, ProjectStatus::Draft | ProjectStatus::Ready)
            || questions::exists_for_project(&mut *tx, project_id).await?
        {
            return Ok(false);
        }

        for question in &variant_questions {
            questions::insert(&mut *tx, question).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_variant_questions(
        &self,
        project_id: &str,
        variant_number: i32,
    ) -> Result<Vec<Question>, StoreError> {
        Ok(questions::list_by_variant(&self.pool, project_id, variant_number).await?)
    }

    async fn list_variant_numbers(&self, project_id: &str) -> Result<Vec<i32>, StoreError> {
        Ok(questions::list_variant_numbers(&self.pool, project_id).await?)
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<ExamSession>, StoreError> {
        Ok(sessions::find_by_id(&self.pool, session_id).await?)
    }

    async fn find_session_for_student(
        &self,
        project_id: &str,
        student_id: &str,
    ) -> Result<Option<ExamSession>, StoreError> {
        Ok(sessions::find_for_student(&self.pool, project_id, student_id).await?)
    }

    async fn create_session_if_absent(
        &self,
        session: NewSession,
    ) -> Result<SlotClaim, StoreError> {
        let mut tx = self.pool.begin().await?;
        sessions::acquire_slot_lock(&mut *tx, &session.project_id, &session.student_id).await?;

        let inserted = sessions::create(&mut *tx, &session).await?;
        let stored =
            sessions::find_for_student(&mut *tx, &session.project_id, &session.student_id)
                .await?
                .ok_or_else(|| {
                    StoreError::Invariant(format!(
                        "session slot {}:{} empty after insert",
                        session.project_id, session.student_id
                    ))
                })?;

        tx.commit().await?;
        Ok(SlotClaim { session: stored, inserted })
    }

    async fn begin_session(
        &self,
        session_id: &str,
        started_at: PrimitiveDateTime,
        deadline_at: PrimitiveDateTime,
    ) -> Result<Option<ExamSession>, StoreError> {
        if let Some(started) =
            sessions::begin(&self.pool, session_id, started_at, deadline_at).await?
        {
            return Ok(Some(started));
        }
        Ok(sessions::find_by_id(&self.pool, session_id).await?)
    }

    async fn count_in_progress(&self) -> Result<i64, StoreError> {
        Ok(sessions::count_in_progress(&self.pool).await?)
    }

    async fn list_sessions_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<ExamSession>, StoreError> {
        Ok(sessions::list_by_project(&self.pool, project_id).await?)
    }

    async fn list_in_progress_sessions(&self) -> Result<Vec<ExamSession>, StoreError> {
        Ok(sessions::list_in_progress(&self.pool).await?)
    }

    async fn save_answers(
        &self,
        session_id: &str,
        values: Vec<(String, serde_json::Value)>,
        now: PrimitiveDateTime,
    ) -> Result<Option<SaveOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(session) = sessions::lock_by_id(&mut *tx, session_id).await? else {
            return Ok(None);
        };
        if session.status != SessionStatus::InProgress {
            return Ok(Some(SaveOutcome::Rejected(session)));
        }

        for (question_id, value) in &values {
            answers::upsert_value(&mut *tx, session_id, question_id, value, now).await?;
        }

        tx.commit().await?;
        Ok(Some(SaveOutcome::Saved(session)))
    }

    async fn list_answers(&self, session_id: &str) -> Result<Vec<Answer>, StoreError> {
        Ok(answers::list_by_session(&self.pool, session_id).await?)
    }

    async fn complete_session(
        &self,
        session_id: &str,
        mode: FinalizeMode,
        final_answers: Vec<(String, serde_json::Value)>,
        now: PrimitiveDateTime,
        grade: GradeFn<'_>,
    ) -> Result<Option<CompletionWrite>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes racing finalizers and answer saves on the slot.
        let Some(session) = sessions::lock_by_id(&mut *tx, session_id).await? else {
            return Ok(None);
        };
        if session.status.is_terminal() {
            return Ok(Some(CompletionWrite::AlreadyFinal(session)));
        }

        for (question_id, value) in &final_answers {
            answers::upsert_value(&mut *tx, session_id, question_id, value, now).await?;
        }
        let stored = answers::list_by_session(&mut *tx, session_id).await?;
        let graded = grade(&stored);

        for answer_grade in &graded.answers {
            answers::apply_grade(&mut *tx, session_id, answer_grade, now).await?;
        }
        let completed = sessions::mark_completed(
            &mut *tx,
            session_id,
            mode,
            graded.score,
            graded.max_score,
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(Some(CompletionWrite::Applied(completed)))
    }

    async fn refresh_session_score(
        &self,
        session_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<ExamSession>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(session) = sessions::lock_by_id(&mut *tx, session_id).await? else {
            return Ok(None);
        };

        let refreshed = Self::refresh_in_tx(&mut tx, session, now).await?;
        tx.commit().await?;
        Ok(Some(refreshed))
    }

    async fn claim_pending_answers(
        &self,
        limit: i64,
        now: PrimitiveDateTime,
        lease_until: PrimitiveDateTime,
    ) -> Result<Vec<Answer>, StoreError> {
        Ok(answers::claim_due(&self.pool, limit, now, lease_until).await?)
    }

    async fn resolve_answer(
        &self,
        session_id: &str,
        question_id: &str,
        resolution: AnswerResolution,
    ) -> Result<Option<ExamSession>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(session) = sessions::lock_by_id(&mut *tx, session_id).await? else {
            return Ok(None);
        };

        if !answers::resolve_pending(&mut *tx, session_id, question_id, &resolution).await? {
            return Ok(None);
        }

        let refreshed = Self::refresh_in_tx(&mut tx, session, resolution.graded_at).await?;
        tx.commit().await?;
        Ok(Some(refreshed))
    }

    async fn defer_answer(
        &self,
        session_id: &str,
        question_id: &str,
        next_attempt_at: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        answers::defer_pending(&self.pool, session_id, question_id, next_attempt_at).await?;
        Ok(())
    }
}
