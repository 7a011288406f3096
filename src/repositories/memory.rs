use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use sqlx::types::Json;
use time::PrimitiveDateTime;
use tokio::sync::Mutex;

use crate::db::models::{Answer, ExamSession, Project, Question};
use crate::db::types::{FinalizeMode, GradingStatus, ProjectStatus, SessionStatus};
use crate::repositories::{
    summarize_answers, AnswerResolution, CompletionWrite, ExamStore, GradeFn, NewProject,
    NewSession, ProjectWindow, SaveOutcome, SlotClaim, StoreError,
};

/// Process-local store used by the `memory` backend and the test suite.
/// One mutex guards all tables, so each trait call is a single atomic step.
#[derive(Default)]
pub(crate) struct MemoryExamStore {
    data: Mutex<MemoryData>,
}

#[derive(Default)]
struct MemoryData {
    projects: HashMap<String, Project>,
    questions: HashMap<String, Vec<Question>>,
    sessions: HashMap<String, ExamSession>,
    slots: HashMap<(String, String), String>,
    answers: HashMap<String, BTreeMap<String, Answer>>,
}

impl MemoryExamStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl MemoryData {
    fn session_answers(&self, session_id: &str) -> Vec<Answer> {
        self.answers.get(session_id).map(|items| items.values().cloned().collect()).unwrap_or_default()
    }

    fn upsert_answers(
        &mut self,
        session_id: &str,
        values: Vec<(String, serde_json::Value)>,
        now: PrimitiveDateTime,
    ) {
        let stored = self.answers.entry(session_id.to_string()).or_default();
        for (question_id, value) in values {
            stored
                .entry(question_id.clone())
                .and_modify(|answer| {
                    answer.value = Json(value.clone());
                    answer.answered_at = now;
                })
                .or_insert_with(|| Answer {
                    session_id: session_id.to_string(),
                    question_id,
                    value: Json(value),
                    is_correct: None,
                    score: None,
                    grading_status: None,
                    feedback: None,
                    grading_attempts: 0,
                    next_grading_at: None,
                    answered_at: now,
                    graded_at: None,
                });
        }
    }

    fn refresh(&mut self, session_id: &str, now: PrimitiveDateTime) -> Option<ExamSession> {
        let stored = self.session_answers(session_id);
        let session = self.sessions.get_mut(session_id)?;
        if session.status.is_terminal() {
            let (score, pending) = summarize_answers(&stored);
            session.score = Some(score);
            session.status = if pending { SessionStatus::Completed } else { SessionStatus::Graded };
            session.updated_at = now;
        }
        Some(session.clone())
    }
}

#[async_trait]
impl ExamStore for MemoryExamStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_project(&self, project: NewProject) -> Result<Project, StoreError> {
        let mut data = self.data.lock().await;
        if data.projects.contains_key(&project.id) {
            return Err(StoreError::Invariant(format!("project {} already exists", project.id)));
        }

        let created = Project {
            id: project.id,
            owner_id: project.owner_id,
            title: project.title,
            status: ProjectStatus::Draft,
            start_time: project.start_time,
            end_time: project.end_time,
            total_time_minutes: project.total_time_minutes,
            variant_count: project.variant_count,
            max_students: project.max_students,
            allowed_student_emails: Json(project.allowed_student_emails),
            created_at: project.created_at,
            updated_at: project.created_at,
        };
        data.projects.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn find_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        Ok(self.data.lock().await.projects.get(project_id).cloned())
    }

    async fn transition_project(
        &self,
        project_id: &str,
        from: ProjectStatus,
        to: ProjectStatus,
        window: Option<ProjectWindow>,
        now: PrimitiveDateTime,
    ) -> Result<Option<Project>, StoreError> {
        let mut data = self.data.lock().await;
        let Some(project) = data.projects.get_mut(project_id) else {
            return Ok(None);
        };
        if project.status != from {
            return Ok(None);
        }

        project.status = to;
        project.updated_at = now;
        if let Some(window) = window {
            project.start_time = Some(window.start_time);
            project.end_time = Some(window.end_time);
        }
        Ok(Some(project.clone()))
    }

    async fn list_projects_past_end(
        &self,
        now: PrimitiveDateTime,
    ) -> Result<Vec<Project>, StoreError> {
        let data = self.data.lock().await;
        let mut due: Vec<Project> = data
            .projects
            .values()
            .filter(|project| matches!(project.status, ProjectStatus::Ready | ProjectStatus::Active))
            .filter(|project| project.end_time.is_some_and(|end| end <= now))
            .cloned()
            .collect();
        due.sort_by_key(|project| project.end_time);
        Ok(due)
    }

    async fn insert_variant_sets(
        &self,
        project_id: &str,
        questions: Vec<Question>,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        let open = data
            .projects
            .get(project_id)
            .is_some_and(|project| matches!(project.status, ProjectStatus::Draft | ProjectStatus::Ready));
        if !open || data.questions.get(project_id).is_some_and(|items| !items.is_empty()) {
            return Ok(false);
        }

        data.questions.insert(project_id.to_string(), questions);
        Ok(true)
    }

    async fn list_variant_questions(
        &self,
        project_id: &str,
        variant_number: i32,
    ) -> Result<Vec<Question>, StoreError> {
        let data = self.data.lock().await;
        let mut items: Vec<Question> = data
            .questions
            .get(project_id)
            .map(|all| {
                all.iter().filter(|question| question.variant_number == variant_number).cloned().collect()
            })
            .unwrap_or_default();
        items.sort_by_key(|question| question.order_index);
        Ok(items)
    }

    async fn list_variant_numbers(&self, project_id: &str) -> Result<Vec<i32>, StoreError> {
        let data = self.data.lock().await;
        let mut numbers: Vec<i32> = data
            .questions
            .get(project_id)
            .map(|all| all.iter().map(|question| question.variant_number).collect())
            .unwrap_or_default();
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<ExamSession>, StoreError> {
        Ok(self.data.lock().await.sessions.get(session_id).cloned())
    }

    async fn find_session_for_student(
        &self,
        project_id: &str,
        student_id: &str,
    ) -> Result<Option<ExamSession>, StoreError> {
        let data = self.data.lock().await;
        let key = (project_id.to_string(), student_id.to_string());
        Ok(data.slots.get(&key).and_then(|id| data.sessions.get(id)).cloned())
    }

    async fn create_session_if_absent(
        &self,
        session: NewSession,
    ) -> Result<SlotClaim, StoreError> {
        let mut data = self.data.lock().await;
        let key = (session.project_id.clone(), session.student_id.clone());

        if let Some(existing_id) = data.slots.get(&key) {
            let existing = data.sessions.get(existing_id).cloned().ok_or_else(|| {
                StoreError::Invariant(format!("slot points at missing session {existing_id}"))
            })?;
            return Ok(SlotClaim { session: existing, inserted: false });
        }

        let created = ExamSession {
            id: session.id,
            project_id: session.project_id,
            student_id: session.student_id,
            student_email: session.student_email,
            variant_number: session.variant_number,
            status: SessionStatus::NotStarted,
            started_at: None,
            deadline_at: None,
            submitted_at: None,
            finalized_by: None,
            score: None,
            max_score: None,
            created_at: session.created_at,
            updated_at: session.created_at,
        };
        data.slots.insert(key, created.id.clone());
        data.sessions.insert(created.id.clone(), created.clone());
        Ok(SlotClaim { session: created, inserted: true })
    }

    async fn begin_session(
        &self,
        session_id: &str,
        started_at: PrimitiveDateTime,
        deadline_at: PrimitiveDateTime,
    ) -> Result<Option<ExamSession>, StoreError> {
        let mut data = self.data.lock().await;
        let Some(session) = data.sessions.get_mut(session_id) else {
            return Ok(None);
        };

        if session.status == SessionStatus::NotStarted {
            session.status = SessionStatus::InProgress;
            session.started_at = Some(started_at);
            session.deadline_at = Some(deadline_at);
            session.updated_at = started_at;
        }
        Ok(Some(session.clone()))
    }

    async fn count_in_progress(&self) -> Result<i64, StoreError> {
        let data = self.data.lock().await;
        Ok(data.sessions.values().filter(|s| s.status == SessionStatus::InProgress).count() as i64)
    }

    async fn list_sessions_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<ExamSession>, StoreError> {
        let data = self.data.lock().await;
        let mut items: Vec<ExamSession> =
            data.sessions.values().filter(|s| s.project_id == project_id).cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn list_in_progress_sessions(&self) -> Result<Vec<ExamSession>, StoreError> {
        let data = self.data.lock().await;
        let mut items: Vec<ExamSession> =
            data.sessions.values().filter(|s| s.status == SessionStatus::InProgress).cloned().collect();
        items.sort_by_key(|session| session.deadline_at);
        Ok(items)
    }

    async fn save_answers(
        &self,
        session_id: &str,
        values: Vec<(String, serde_json::Value)>,
        now: PrimitiveDateTime,
    ) -> Result<Option<SaveOutcome>, StoreError> {
        let mut data = self.data.lock().await;
        let Some(session) = data.sessions.get(session_id).cloned() else {
            return Ok(None);
        };
        if session.status != SessionStatus::InProgress {
            return Ok(Some(SaveOutcome::Rejected(session)));
        }

        data.upsert_answers(session_id, values, now);
        Ok(Some(SaveOutcome::Saved(session)))
    }

    async fn list_answers(&self, session_id: &str) -> Result<Vec<Answer>, StoreError> {
        Ok(self.data.lock().await.session_answers(session_id))
    }

    async fn complete_session(
        &self,
        session_id: &str,
        mode: FinalizeMode,
        final_answers: Vec<(String, serde_json::Value)>,
        now: PrimitiveDateTime,
        grade: GradeFn<'_>,
    ) -> Result<Option<CompletionWrite>, StoreError> {
        let mut data = self.data.lock().await;
        let Some(current) = data.sessions.get(session_id).cloned() else {
            return Ok(None);
        };
        if current.status.is_terminal() {
            return Ok(Some(CompletionWrite::AlreadyFinal(current)));
        }

        data.upsert_answers(session_id, final_answers, now);
        let graded = grade(&data.session_answers(session_id));
        if let Some(stored) = data.answers.get_mut(session_id) {
            for answer_grade in &graded.answers {
                if let Some(answer) = stored.get_mut(&answer_grade.question_id) {
                    answer.grading_status = Some(answer_grade.grading_status);
                    answer.is_correct = answer_grade.is_correct;
                    answer.score = answer_grade.score;
                    let pending = answer_grade.grading_status == GradingStatus::Pending;
                    answer.graded_at = (!pending).then_some(now);
                    answer.next_grading_at = pending.then_some(now);
                }
            }
        }

        let session = data
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::Invariant(format!("session {session_id} vanished")))?;
        session.status = SessionStatus::Completed;
        session.finalized_by = Some(mode);
        session.submitted_at = Some(now);
        session.score = Some(graded.score);
        session.max_score = Some(graded.max_score);
        session.updated_at = now;
        Ok(Some(CompletionWrite::Applied(session.clone())))
    }

    async fn refresh_session_score(
        &self,
        session_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<Option<ExamSession>, StoreError> {
        Ok(self.data.lock().await.refresh(session_id, now))
    }

    async fn claim_pending_answers(
        &self,
        limit: i64,
        now: PrimitiveDateTime,
        lease_until: PrimitiveDateTime,
    ) -> Result<Vec<Answer>, StoreError> {
        let mut data = self.data.lock().await;
        let mut due: Vec<&mut Answer> = data
            .answers
            .values_mut()
            .flat_map(|items| items.values_mut())
            .filter(|answer| answer.grading_status == Some(GradingStatus::Pending))
            .filter(|answer| answer.next_grading_at.is_some_and(|at| at <= now))
            .collect();
        due.sort_by_key(|answer| answer.next_grading_at);

        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|answer| {
                answer.next_grading_at = Some(lease_until);
                answer.clone()
            })
            .collect())
    }

    async fn resolve_answer(
        &self,
        session_id: &str,
        question_id: &str,
        resolution: AnswerResolution,
    ) -> Result<Option<ExamSession>, StoreError> {
        let mut data = self.data.lock().await;
        let Some(answer) =
            data.answers.get_mut(session_id).and_then(|items| items.get_mut(question_id))
        else {
            return Ok(None);
        };
        if answer.grading_status != Some(GradingStatus::Pending) {
            return Ok(None);
        }

        answer.grading_status = Some(GradingStatus::Graded);
        answer.is_correct = Some(resolution.is_correct);
        answer.score = Some(resolution.score);
        answer.feedback = resolution.feedback;
        answer.graded_at = Some(resolution.graded_at);
        answer.next_grading_at = None;
        answer.grading_attempts += 1;

        Ok(data.refresh(session_id, resolution.graded_at))
    }

    async fn defer_answer(
        &self,
        session_id: &str,
        question_id: &str,
        next_attempt_at: PrimitiveDateTime,
    ) -> Result<(), StoreError> {
        let mut data = self.data.lock().await;
        if let Some(answer) =
            data.answers.get_mut(session_id).and_then(|items| items.get_mut(question_id))
        {
            if answer.grading_status == Some(GradingStatus::Pending) {
                answer.grading_attempts += 1;
                answer.next_grading_at = Some(next_attempt_at);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::macros::datetime;

    use super::*;
    use crate::repositories::{AnswerGrade, SessionGrade};

    fn new_session(id: &str, variant: i32) -> NewSession {
        NewSession {
            id: id.to_string(),
            project_id: "p1".to_string(),
            student_id: "s1".to_string(),
            student_email: "s1@example.com".to_string(),
            variant_number: variant,
            created_at: datetime!(2025-03-01 09:00:00),
        }
    }

    #[tokio::test]
    async fn concurrent_slot_claims_produce_one_session() {
        let store = Arc::new(MemoryExamStore::new());
        let mut handles = Vec::new();
        for attempt in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create_session_if_absent(new_session(&format!("sess-{attempt}"), attempt % 3 + 1))
                    .await
                    .unwrap()
            }));
        }

        let mut claims = Vec::new();
        for handle in handles {
            claims.push(handle.await.unwrap());
        }

        assert_eq!(claims.iter().filter(|claim| claim.inserted).count(), 1);
        let first = &claims[0].session;
        assert!(claims.iter().all(|claim| claim.session.id == first.id
            && claim.session.variant_number == first.variant_number));
        assert_eq!(store.list_sessions_by_project("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completion_is_a_single_compare_and_set() {
        let store = MemoryExamStore::new();
        let claim = store.create_session_if_absent(new_session("sess", 1)).await.unwrap();
        let now = datetime!(2025-03-01 09:05:00);
        store.begin_session(&claim.session.id, now, datetime!(2025-03-01 10:05:00)).await.unwrap();
        store
            .save_answers(&claim.session.id, vec![("q1".into(), serde_json::json!(1))], now)
            .await
            .unwrap();

        let grade = |answers: &[Answer]| SessionGrade {
            answers: answers
                .iter()
                .map(|answer| AnswerGrade {
                    question_id: answer.question_id.clone(),
                    grading_status: GradingStatus::Graded,
                    is_correct: Some(true),
                    score: Some(5.0),
                })
                .collect(),
            score: 5.0,
            max_score: 10.0,
        };
        let lower = |_: &[Answer]| SessionGrade { answers: Vec::new(), score: 0.0, max_score: 10.0 };

        let first = store
            .complete_session(&claim.session.id, FinalizeMode::ManualSubmit, Vec::new(), now, &grade)
            .await
            .unwrap();
        let second = store
            .complete_session(&claim.session.id, FinalizeMode::AutoDeadline, Vec::new(), now, &lower)
            .await
            .unwrap();

        assert!(matches!(first, Some(CompletionWrite::Applied(_))));
        let Some(CompletionWrite::AlreadyFinal(session)) = second else {
            panic!("second completion must observe the terminal state");
        };
        assert_eq!(session.score, Some(5.0));
        assert_eq!(session.finalized_by, Some(FinalizeMode::ManualSubmit));
    }

    #[tokio::test]
    async fn answers_are_rejected_outside_in_progress() {
        let store = MemoryExamStore::new();
        let claim = store.create_session_if_absent(new_session("sess", 1)).await.unwrap();
        let now = datetime!(2025-03-01 09:05:00);

        let outcome = store
            .save_answers(&claim.session.id, vec![("q1".into(), serde_json::json!("a"))], now)
            .await
            .unwrap();

        assert!(matches!(outcome, Some(SaveOutcome::Rejected(_))));
        assert!(store.list_answers(&claim.session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claims_lease_pending_answers() {
        let store = MemoryExamStore::new();
        let claim = store.create_session_if_absent(new_session("sess", 1)).await.unwrap();
        let now = datetime!(2025-03-01 09:05:00);
        store.begin_session(&claim.session.id, now, datetime!(2025-03-01 10:05:00)).await.unwrap();
        store
            .save_answers(&claim.session.id, vec![("essay".into(), serde_json::json!("text"))], now)
            .await
            .unwrap();
        let pending = |answers: &[Answer]| SessionGrade {
            answers: answers
                .iter()
                .map(|answer| AnswerGrade {
                    question_id: answer.question_id.clone(),
                    grading_status: GradingStatus::Pending,
                    is_correct: None,
                    score: None,
                })
                .collect(),
            score: 0.0,
            max_score: 4.0,
        };
        store
            .complete_session(&claim.session.id, FinalizeMode::ManualSubmit, Vec::new(), now, &pending)
            .await
            .unwrap();

        let lease_until = datetime!(2025-03-01 09:10:00);
        let first = store.claim_pending_answers(10, now, lease_until).await.unwrap();
        let second = store.claim_pending_answers(10, now, lease_until).await.unwrap();
        let after_lease = store
            .claim_pending_answers(10, lease_until, datetime!(2025-03-01 09:15:00))
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(after_lease.len(), 1);
    }
}
