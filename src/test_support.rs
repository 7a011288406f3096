use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use serde_json::{json, Value};
use sqlx::types::Json;
use time::macros::datetime;
use time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::api;
use crate::core::{config::Settings, redis::RedisHandle, security, state::AppState};
use crate::db::models::{Answer, Project, Question};
use crate::db::types::{ProjectStatus, QuestionType, UserRole};
use crate::repositories::memory::MemoryExamStore;
use crate::repositories::{ExamStore, NewProject};

const TEST_SECRET_KEY: &str = "test-secret";
pub(crate) const TEACHER_ID: &str = "teacher-1";
pub(crate) const STUDENT_EMAIL: &str = "student@example.com";
pub(crate) const SECOND_EMAIL: &str = "second@example.com";

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
}

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("EXAM_ENV", "test");
    std::env::set_var("EXAM_STRICT_CONFIG", "0");
    std::env::set_var("SECRET_KEY", TEST_SECRET_KEY);
    std::env::set_var("EXAM_STORE_BACKEND", "memory");
    std::env::set_var("REDIS_HOST", "127.0.0.1");
    std::env::set_var("REDIS_DB", "1");
    std::env::remove_var("REDIS_PASSWORD");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("GRADING_WORKER_CONCURRENCY");
}

/// State over the in-memory store with Redis left disconnected, so rate
/// limits fail open.
pub(crate) fn build_memory_state() -> AppState {
    build_memory_state_with(Settings::for_tests())
}

pub(crate) fn build_memory_state_with(settings: Settings) -> AppState {
    let redis = RedisHandle::new(settings.redis().redis_url());
    AppState::new(settings, Arc::new(MemoryExamStore::new()), redis)
}

pub(crate) fn setup_test_context() -> TestContext {
    let state = build_memory_state();
    let app = api::router::router(state.clone());
    TestContext { state, app }
}

pub(crate) fn sample_project(project_id: &str, variant_count: i32) -> Project {
    let created_at = datetime!(2025-05-01 08:00:00);
    Project {
        id: project_id.to_string(),
        owner_id: TEACHER_ID.to_string(),
        title: format!("Midterm {project_id}"),
        status: ProjectStatus::Draft,
        start_time: None,
        end_time: None,
        total_time_minutes: 60,
        variant_count,
        max_students: None,
        allowed_student_emails: Json(vec![STUDENT_EMAIL.to_string(), SECOND_EMAIL.to_string()]),
        created_at,
        updated_at: created_at,
    }
}

pub(crate) fn question(
    project_id: &str,
    variant_number: i32,
    order_index: i32,
    question_type: QuestionType,
    points: f64,
) -> Question {
    let correct_answer = match question_type {
        QuestionType::SingleChoice => json!(0),
        QuestionType::MultipleChoice => json!([0]),
        QuestionType::TrueFalse => json!(true),
        QuestionType::Matching => json!([["a", "1"]]),
        QuestionType::ShortAnswer | QuestionType::Essay => Value::Null,
    };

    Question {
        id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        variant_number,
        order_index,
        question_type,
        text: format!("Question {order_index} of variant {variant_number}"),
        points,
        options: Json(json!(["a", "b", "c"])),
        correct_answer: Json(correct_answer),
        expected_keywords: Json(Vec::new()),
        rubric: None,
    }
}

pub(crate) fn answer(session_id: &str, question_id: &str, value: Value) -> Answer {
    Answer {
        session_id: session_id.to_string(),
        question_id: question_id.to_string(),
        value: Json(value),
        is_correct: None,
        score: None,
        grading_status: None,
        feedback: None,
        grading_attempts: 0,
        next_grading_at: None,
        answered_at: datetime!(2025-05-01 10:00:00),
        graded_at: None,
    }
}

/// Creates a draft project owned by `TEACHER_ID` with one variant per
/// distinct `variant_number` in `questions`.
pub(crate) async fn create_project_with_variants(
    store: &dyn ExamStore,
    project_id: &str,
    questions: Vec<Question>,
) -> Project {
    let variants: BTreeSet<i32> = questions.iter().map(|q| q.variant_number).collect();
    let template = sample_project(project_id, i32::try_from(variants.len()).unwrap_or(1).max(1));

    let project = store
        .create_project(NewProject {
            id: template.id,
            owner_id: template.owner_id,
            title: template.title,
            start_time: None,
            end_time: None,
            total_time_minutes: template.total_time_minutes,
            variant_count: template.variant_count,
            max_students: None,
            allowed_student_emails: template.allowed_student_emails.0,
            created_at: template.created_at,
        })
        .await
        .expect("create project");
    assert!(store.insert_variant_sets(project_id, questions).await.expect("insert variant sets"));
    project
}

pub(crate) fn teacher_token(settings: &Settings) -> String {
    security::create_access_token(TEACHER_ID, UserRole::Teacher, None, settings, Duration::minutes(60))
        .expect("token")
}

pub(crate) fn student_token(student_id: &str, email: &str, settings: &Settings) -> String {
    security::create_access_token(
        student_id,
        UserRole::Student,
        Some(email),
        settings,
        Duration::minutes(60),
    )
    .expect("token")
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
