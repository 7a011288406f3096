use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::types::ProjectStatus;
use crate::repositories::StoreError;

#[derive(Debug, Error)]
pub(crate) enum ExamError {
    #[error("exam is not yet available")]
    NotYetAvailable { opens_at: Option<PrimitiveDateTime>, wait_seconds: Option<i64> },
    #[error("student is not on the allowlist for this project")]
    NotAllowlisted,
    #[error("project is completed")]
    ProjectCompleted,
    #[error("cannot move project from {from:?} to {to:?}")]
    InvalidTransition { from: ProjectStatus, to: ProjectStatus },
    #[error("project has no allowed students configured")]
    NoStudentsConfigured,
    #[error("variant {variant_number} of project {project_id} has no questions")]
    VariantDataMissing { project_id: String, variant_number: i32 },
    #[error("async grader unavailable: {0}")]
    AsyncGraderUnavailable(String),
    #[error("duplicate session attempt for project {project_id} and student {student_id}")]
    DuplicateSessionAttempt { project_id: String, student_id: String },
    #[error("session already submitted")]
    AlreadySubmitted,
    #[error("session is not in progress")]
    SessionNotActive,
    #[error("question {0} is not part of the assigned variant")]
    UnknownQuestion(String),
    #[error("variant sets are locked for this project")]
    VariantSetsLocked,
    #[error("invalid variant sets: {0}")]
    InvalidVariantSets(String),
    #[error("lobby is full")]
    LobbyFull,
    #[error("exam service is at capacity")]
    AtCapacity,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}
