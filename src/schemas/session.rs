use serde::{Deserialize, Serialize};
use time::PrimitiveDateTime;

use crate::core::time::{format_primitive, seconds_until};
use crate::db::models::{Answer, ExamSession};
use crate::db::types::{FinalizeMode, GradingStatus, QuestionType, SessionStatus};

/// Question as shown to the student taking the attempt.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct QuestionView {
    pub(crate) id: String,
    pub(crate) order: i32,
    pub(crate) question_type: QuestionType,
    pub(crate) text: String,
    pub(crate) points: f64,
    pub(crate) options: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionResponse {
    pub(crate) id: String,
    pub(crate) project_id: String,
    pub(crate) student_id: String,
    pub(crate) student_email: String,
    pub(crate) variant_number: i32,
    pub(crate) status: SessionStatus,
    pub(crate) started_at: Option<String>,
    pub(crate) deadline_at: Option<String>,
    pub(crate) submitted_at: Option<String>,
    pub(crate) finalized_by: Option<FinalizeMode>,
    pub(crate) score: Option<f64>,
    pub(crate) max_score: Option<f64>,
    /// Server-side remaining time; only present while the attempt is open.
    pub(crate) remaining_seconds: Option<i64>,
}

impl SessionResponse {
    pub(crate) fn from_session(session: ExamSession, now: PrimitiveDateTime) -> Self {
        let remaining_seconds = match (session.status, session.deadline_at) {
            (SessionStatus::InProgress, Some(deadline)) => Some(seconds_until(now, deadline)),
            _ => None,
        };

        Self {
            id: session.id,
            project_id: session.project_id,
            student_id: session.student_id,
            student_email: session.student_email,
            variant_number: session.variant_number,
            status: session.status,
            started_at: session.started_at.map(format_primitive),
            deadline_at: session.deadline_at.map(format_primitive),
            submitted_at: session.submitted_at.map(format_primitive),
            finalized_by: session.finalized_by,
            score: session.score,
            max_score: session.max_score,
            remaining_seconds,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct StartSessionResponse {
    pub(crate) session: SessionResponse,
    pub(crate) questions: Vec<QuestionView>,
    pub(crate) resumed: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnswerView {
    pub(crate) question_id: String,
    pub(crate) value: serde_json::Value,
    pub(crate) grading_status: Option<GradingStatus>,
    pub(crate) is_correct: Option<bool>,
    pub(crate) score: Option<f64>,
    pub(crate) feedback: Option<String>,
    pub(crate) answered_at: String,
}

impl From<Answer> for AnswerView {
    fn from(answer: Answer) -> Self {
        Self {
            question_id: answer.question_id,
            value: answer.value.0,
            grading_status: answer.grading_status,
            is_correct: answer.is_correct,
            score: answer.score,
            feedback: answer.feedback,
            answered_at: format_primitive(answer.answered_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionDetailResponse {
    pub(crate) session: SessionResponse,
    pub(crate) questions: Vec<QuestionView>,
    pub(crate) answers: Vec<AnswerView>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnswerInput {
    #[serde(alias = "questionId")]
    pub(crate) question_id: String,
    #[serde(default)]
    pub(crate) value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnswersSave {
    pub(crate) answers: Vec<AnswerInput>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnswersSaved {
    pub(crate) session_id: String,
    pub(crate) saved: usize,
    pub(crate) saved_at: String,
    pub(crate) remaining_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitResponse {
    pub(crate) session: SessionResponse,
    /// `false` when the attempt had already been finalized by the timer or
    /// an earlier submit.
    pub(crate) submitted_now: bool,
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn session(status: SessionStatus) -> ExamSession {
        let created = datetime!(2025-05-01 10:00:00);
        ExamSession {
            id: "s1".into(),
            project_id: "p1".into(),
            student_id: "u1".into(),
            student_email: "u1@example.com".into(),
            variant_number: 2,
            status,
            started_at: Some(created),
            deadline_at: Some(datetime!(2025-05-01 11:00:00)),
            submitted_at: None,
            finalized_by: None,
            score: None,
            max_score: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn remaining_seconds_only_for_open_attempts() {
        let now = datetime!(2025-05-01 10:59:30);
        let open = SessionResponse::from_session(session(SessionStatus::InProgress), now);
        assert_eq!(open.remaining_seconds, Some(30));
        assert_eq!(open.deadline_at.as_deref(), Some("2025-05-01T11:00:00Z"));

        let done = SessionResponse::from_session(session(SessionStatus::Completed), now);
        assert_eq!(done.remaining_seconds, None);
    }
}
