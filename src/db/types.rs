use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "projectstatus", rename_all = "lowercase")]
pub(crate) enum ProjectStatus {
    Draft,
    Ready,
    Active,
    Completed,
}

impl ProjectStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "sessionstatus", rename_all = "snake_case")]
pub(crate) enum SessionStatus {
    NotStarted,
    InProgress,
    Completed,
    Graded,
}

impl SessionStatus {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Graded)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Graded => "graded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "gradingstatus", rename_all = "lowercase")]
pub(crate) enum GradingStatus {
    Graded,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(type_name = "questiontype", rename_all = "kebab-case")]
pub(crate) enum QuestionType {
    SingleChoice,
    MultipleChoice,
    TrueFalse,
    Matching,
    ShortAnswer,
    Essay,
}

impl QuestionType {
    /// Objective questions are scored synchronously at finalization.
    pub(crate) fn is_objective(self) -> bool {
        !matches!(self, Self::ShortAnswer | Self::Essay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "finalizemode", rename_all = "snake_case")]
pub(crate) enum FinalizeMode {
    ManualSubmit,
    AutoDeadline,
    ProjectClosed,
}

impl FinalizeMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::ManualSubmit => "manual_submit",
            Self::AutoDeadline => "auto_deadline",
            Self::ProjectClosed => "project_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum UserRole {
    Teacher,
    Student,
}
