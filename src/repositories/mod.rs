pub(crate) mod answers;
pub(crate) mod memory;
pub(crate) mod postgres;
pub(crate) mod projects;
pub(crate) mod questions;
pub(crate) mod sessions;

use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::{Answer, ExamSession, Project, Question};
use crate::db::types::{FinalizeMode, GradingStatus, ProjectStatus};

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store invariant violated: {0}")]
    Invariant(String),
}

/// Result of the create-if-absent write on a (project, student) slot.
#[derive(Debug, Clone)]
pub(crate) struct SlotClaim {
    pub(crate) session: ExamSession,
    pub(crate) inserted: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum SaveOutcome {
    Saved(ExamSession),
    Rejected(ExamSession),
}

#[derive(Debug, Clone)]
pub(crate) enum CompletionWrite {
    Applied(ExamSession),
    AlreadyFinal(ExamSession),
}

#[derive(Debug, Clone)]
pub(crate) struct AnswerGrade {
    pub(crate) question_id: String,
    pub(crate) grading_status: GradingStatus,
    pub(crate) is_correct: Option<bool>,
    pub(crate) score: Option<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionGrade {
    pub(crate) answers: Vec<AnswerGrade>,
    pub(crate) score: f64,
    pub(crate) max_score: f64,
}

/// Scores the answers recorded at the moment the slot is locked.
pub(crate) type GradeFn<'a> = &'a (dyn Fn(&[Answer]) -> SessionGrade + Send + Sync);

#[derive(Debug, Clone)]
pub(crate) struct AnswerResolution {
    pub(crate) is_correct: bool,
    pub(crate) score: f64,
    pub(crate) feedback: Option<String>,
    pub(crate) graded_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProjectWindow {
    pub(crate) start_time: PrimitiveDateTime,
    pub(crate) end_time: PrimitiveDateTime,
}

#[derive(Debug, Clone)]
pub(crate) struct NewProject {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) title: String,
    pub(crate) start_time: Option<PrimitiveDateTime>,
    pub(crate) end_time: Option<PrimitiveDateTime>,
    pub(crate) total_time_minutes: i32,
    pub(crate) variant_count: i32,
    pub(crate) max_students: Option<i32>,
    pub(crate) allowed_student_emails: Vec<String>,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone)]
pub(crate) struct NewSession {
    pub(crate) id: String,
    pub(crate) project_id: String,
    pub(crate) student_id: String,
    pub(crate) student_email: String,
    pub(crate) variant_number: i32,
    pub(crate) created_at: PrimitiveDateTime,
}

/// Durable state for projects, variant question sets, sessions and answers.
///
/// Every write on a session slot is a single conditional operation: callers
/// never read, decide and then write in separate steps.
#[async_trait]
pub(crate) trait ExamStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_project(&self, project: NewProject) -> Result<Project, StoreError>;
    async fn find_project(&self, project_id: &str) -> Result<Option<Project>, StoreError>;
    /// Moves the project from `from` to `to`, optionally pinning its time
    /// window; `None` when the status changed underneath.
    async fn transition_project(
        &self,
        project_id: &str,
        from: ProjectStatus,
        to: ProjectStatus,
        window: Option<ProjectWindow>,
        now: PrimitiveDateTime,
    ) -> Result<Option<Project>, StoreError>;
    async fn list_projects_past_end(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Vec<Project>, StoreError>;

    /// Stores generated variant sets once. Returns `false` if the project
    /// already has questions or has moved past `ready`.
    async fn insert_variant_sets(
        &self,
        project_id: &str,
        questions: Vec<Question>,
    ) -> Result<bool, StoreError>;
    async fn list_variant_questions(
        &self,
        project_id: &str,
        variant_number: i32,
    ) -> Result<Vec<Question>, StoreError>;
    async fn list_variant_numbers(&self, project_id: &str) -> Result<Vec<i32>, StoreError>;

    async fn find_session(&self, session_id: &str) -> Result<Option<ExamSession>, StoreError>;
    async fn find_session_for_student(
        &self,
        project_id: &str,
        student_id: &str,
    ) -> Result<Option<ExamSession>, StoreError>;
    async fn create_session_if_absent(&self, session: NewSession)
        -> Result<SlotClaim, StoreError>;
    /// `not_started -> in_progress`; returns the current row either way.
    async fn begin_session(
        &self,
        session_id: &str,
        started_at: PrimitiveDateTime,
        deadline_at: PrimitiveDateTime,
    ) -> Result<Option<ExamSession>, StoreError>;
    async fn count_in_progress(&self) -> Result<i64, StoreError>;
    async fn list_sessions_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<ExamSession>, StoreError>;
    async fn list_in_progress_sessions(&self) -> Result<Vec<ExamSession>, StoreError>;

    async fn save_answers(
        &self,
        session_id: &str,
        answers: Vec<(String, serde_json::Value)>,
        now: PrimitiveDateTime,
    ) -> Result<Option<SaveOutcome>, StoreError>;
    async fn list_answers(&self, session_id: &str) -> Result<Vec<Answer>, StoreError>;

    /// Compare-and-set out of the open states. `final_answers` are written and
    /// `grade` runs while the slot is held, so the scored answers are exactly
    /// the stored ones.
    async fn complete_session(
        &self,
        session_id: &str,
        mode: FinalizeMode,
        final_answers: Vec<(String, serde_json::Value)>,
        now: PrimitiveDateTime,
        grade: GradeFn<'_>,
    ) -> Result<Option<CompletionWrite>, StoreError>;
    /// Recomputes the score from graded answers and promotes a completed
    /// session to `graded` once nothing is pending.
    async fn refresh_session_score(
        &self,
        session_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<ExamSession>, StoreError>;

    /// Leases due pending answers until `lease_until`.
    async fn claim_pending_answers(
        &self,
        limit: i64,
        now: PrimitiveDateTime,
        lease_until: PrimitiveDateTime,
    ) -> Result<Vec<Answer>, StoreError>;
    /// Applies an async grade if the answer is still pending; returns the
    /// refreshed session when it was applied.
    async fn resolve_answer(
        &self,
        session_id: &str,
        question_id: &str,
        resolution: AnswerResolution,
    ) -> Result<Option<ExamSession>, StoreError>;
    async fn defer_answer(
        &self,
        session_id: &str,
        question_id: &str,
        next_attempt_at: PrimitiveDateTime,
    ) -> Result<(), StoreError>;
}

/// Score sum and completion flag derived from the stored answers.
pub(crate) fn summarize_answers(answers: &[Answer]) -> (f64, bool) {
    let score = answers
        .iter()
        .filter(|answer| answer.grading_status == Some(GradingStatus::Graded))
        .filter_map(|answer| answer.score)
        .fold(0.0, |total, score| total + score);
    let pending = answers.iter().any(|answer| answer.grading_status == Some(GradingStatus::Pending));
    (score, pending)
}
