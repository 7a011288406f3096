use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::core::time::format_primitive;
use crate::services::errors::ExamError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    opens_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_seconds: Option<i64>,
}

impl ErrorResponse {
    fn plain(status: StatusCode, detail: String) -> Self {
        Self { status: status.as_u16(), detail, code: None, opens_at: None, wait_seconds: None }
    }
}

/// Structured rejection of an exam operation.
#[derive(Debug)]
pub(crate) struct Rejection {
    pub(crate) status: StatusCode,
    pub(crate) code: &'static str,
    pub(crate) detail: String,
    pub(crate) opens_at: Option<String>,
    pub(crate) wait_seconds: Option<i64>,
    pub(crate) retry_after: Option<u64>,
}

impl Rejection {
    fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
            opens_at: None,
            wait_seconds: None,
            retry_after: None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str),
    Forbidden(&'static str),
    BadRequest(String),
    NotFound(String),
    TooManyRequests(&'static str),
    Rejected(Box<Rejection>),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl From<ExamError> for ApiError {
    fn from(err: ExamError) -> Self {
        let detail = err.to_string();
        let rejection = match err {
            ExamError::NotYetAvailable { opens_at, wait_seconds } => Rejection {
                opens_at: opens_at.map(format_primitive),
                wait_seconds,
                retry_after: wait_seconds.and_then(|seconds| u64::try_from(seconds.max(1)).ok()),
                ..Rejection::new(StatusCode::FORBIDDEN, "not_yet_available", detail)
            },
            ExamError::NotAllowlisted => {
                Rejection::new(StatusCode::FORBIDDEN, "not_allowlisted", detail)
            }
            ExamError::ProjectCompleted => {
                Rejection::new(StatusCode::FORBIDDEN, "project_completed", detail)
            }
            ExamError::InvalidTransition { .. } => {
                Rejection::new(StatusCode::CONFLICT, "invalid_transition", detail)
            }
            ExamError::NoStudentsConfigured => {
                Rejection::new(StatusCode::UNPROCESSABLE_ENTITY, "no_students_configured", detail)
            }
            ExamError::VariantDataMissing { .. } => {
                Rejection::new(StatusCode::CONFLICT, "variant_data_missing", detail)
            }
            ExamError::AsyncGraderUnavailable(_) => Rejection {
                retry_after: Some(30),
                ..Rejection::new(StatusCode::SERVICE_UNAVAILABLE, "grader_unavailable", detail)
            },
            ExamError::AlreadySubmitted => {
                Rejection::new(StatusCode::CONFLICT, "already_submitted", detail)
            }
            ExamError::SessionNotActive => {
                Rejection::new(StatusCode::CONFLICT, "session_not_active", detail)
            }
            ExamError::UnknownQuestion(_) => {
                Rejection::new(StatusCode::BAD_REQUEST, "unknown_question", detail)
            }
            ExamError::VariantSetsLocked => {
                Rejection::new(StatusCode::CONFLICT, "variant_sets_locked", detail)
            }
            ExamError::InvalidVariantSets(_) => {
                Rejection::new(StatusCode::BAD_REQUEST, "invalid_variant_sets", detail)
            }
            ExamError::LobbyFull => Rejection::new(StatusCode::CONFLICT, "lobby_full", detail),
            ExamError::AtCapacity => Rejection {
                retry_after: Some(5),
                ..Rejection::new(StatusCode::SERVICE_UNAVAILABLE, "at_capacity", detail)
            },
            ExamError::NotFound(what) => {
                Rejection::new(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
            }
            ExamError::Forbidden(message) => {
                Rejection::new(StatusCode::FORBIDDEN, "forbidden", message)
            }
            ExamError::DuplicateSessionAttempt { .. } => {
                return ApiError::internal(detail, "Session slot invariant violated");
            }
            ExamError::Store(err) => return ApiError::internal(err, "Exam store operation failed"),
        };
        ApiError::Rejected(Box::new(rejection))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(message) => {
                let status = StatusCode::UNAUTHORIZED;
                let mut response =
                    (status, Json(ErrorResponse::plain(status, message.to_string()))).into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            ApiError::Forbidden(message) => {
                let status = StatusCode::FORBIDDEN;
                (status, Json(ErrorResponse::plain(status, message.to_string()))).into_response()
            }
            ApiError::BadRequest(message) => {
                let status = StatusCode::BAD_REQUEST;
                (status, Json(ErrorResponse::plain(status, message))).into_response()
            }
            ApiError::NotFound(message) => {
                let status = StatusCode::NOT_FOUND;
                (status, Json(ErrorResponse::plain(status, message))).into_response()
            }
            ApiError::TooManyRequests(message) => {
                let status = StatusCode::TOO_MANY_REQUESTS;
                (status, Json(ErrorResponse::plain(status, message.to_string()))).into_response()
            }
            ApiError::Rejected(rejection) => {
                let Rejection { status, code, detail, opens_at, wait_seconds, retry_after } =
                    *rejection;
                if status.is_server_error() {
                    tracing::warn!(code, detail = %detail, "Request rejected");
                }
                let body = ErrorResponse {
                    status: status.as_u16(),
                    detail,
                    code: Some(code),
                    opens_at,
                    wait_seconds,
                };
                let mut response = (status, Json(body)).into_response();
                if let Some(seconds) = retry_after {
                    if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                        response.headers_mut().insert(header::RETRY_AFTER, value);
                    }
                }
                response
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                (status, Json(ErrorResponse::plain(status, message))).into_response()
            }
        }
    }
}
