use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{FinalizeMode, GradingStatus, ProjectStatus, QuestionType, SessionStatus};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Project {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) title: String,
    pub(crate) status: ProjectStatus,
    pub(crate) start_time: Option<PrimitiveDateTime>,
    pub(crate) end_time: Option<PrimitiveDateTime>,
    pub(crate) total_time_minutes: i32,
    pub(crate) variant_count: i32,
    pub(crate) max_students: Option<i32>,
    pub(crate) allowed_student_emails: Json<Vec<String>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

impl Project {
    pub(crate) fn allows_email(&self, email: &str) -> bool {
        let email = email.trim();
        self.allowed_student_emails.0.iter().any(|allowed| allowed.trim().eq_ignore_ascii_case(email))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Question {
    pub(crate) id: String,
    pub(crate) project_id: String,
    pub(crate) variant_number: i32,
    pub(crate) order_index: i32,
    pub(crate) question_type: QuestionType,
    pub(crate) text: String,
    pub(crate) points: f64,
    pub(crate) options: Json<serde_json::Value>,
    pub(crate) correct_answer: Json<serde_json::Value>,
    pub(crate) expected_keywords: Json<Vec<String>>,
    pub(crate) rubric: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct ExamSession {
    pub(crate) id: String,
    pub(crate) project_id: String,
    pub(crate) student_id: String,
    pub(crate) student_email: String,
    pub(crate) variant_number: i32,
    pub(crate) status: SessionStatus,
    pub(crate) started_at: Option<PrimitiveDateTime>,
    pub(crate) deadline_at: Option<PrimitiveDateTime>,
    pub(crate) submitted_at: Option<PrimitiveDateTime>,
    pub(crate) finalized_by: Option<FinalizeMode>,
    pub(crate) score: Option<f64>,
    pub(crate) max_score: Option<f64>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Answer {
    pub(crate) session_id: String,
    pub(crate) question_id: String,
    pub(crate) value: Json<serde_json::Value>,
    pub(crate) is_correct: Option<bool>,
    pub(crate) score: Option<f64>,
    pub(crate) grading_status: Option<GradingStatus>,
    pub(crate) feedback: Option<String>,
    pub(crate) grading_attempts: i32,
    pub(crate) next_grading_at: Option<PrimitiveDateTime>,
    pub(crate) answered_at: PrimitiveDateTime,
    pub(crate) graded_at: Option<PrimitiveDateTime>,
}
