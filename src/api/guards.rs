use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::{header, request::Parts};

use crate::api::errors::ApiError;
use crate::core::{security, state::AppState};
use crate::db::models::Project;
use crate::db::types::UserRole;
use crate::services::errors::ExamError;

/// Caller identity taken from the verified bearer token.
#[derive(Debug, Clone)]
pub(crate) struct AuthUser {
    pub(crate) id: String,
    pub(crate) role: UserRole,
    pub(crate) email: Option<String>,
}

pub(crate) struct CurrentUser(pub(crate) AuthUser);

#[derive(Debug, Clone)]
pub(crate) struct Student {
    pub(crate) id: String,
    pub(crate) email: String,
}

pub(crate) struct CurrentStudent(pub(crate) Student);
pub(crate) struct CurrentTeacher(pub(crate) AuthUser);

/// Verifies a raw token. Shared by the header extractors and the WebSocket
/// handshake, which carries the token in the query string.
pub(crate) fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, ApiError> {
    let claims = security::verify_token(token, state.settings())
        .map_err(|_| ApiError::Unauthorized("Invalid authentication credentials"))?;

    if claims.sub.trim().is_empty() {
        return Err(ApiError::Unauthorized("Invalid authentication credentials"));
    }

    Ok(AuthUser { id: claims.sub, role: claims.role, email: claims.email })
}

pub(crate) fn as_student(user: AuthUser) -> Result<Student, ApiError> {
    if user.role != UserRole::Student {
        return Err(ApiError::Forbidden("Student access required"));
    }
    let email = user
        .email
        .filter(|email| !email.trim().is_empty())
        .ok_or(ApiError::Unauthorized("Token has no email claim"))?;
    Ok(Student { id: user.id, email })
}

pub(crate) fn as_teacher(user: AuthUser) -> Result<AuthUser, ApiError> {
    if user.role != UserRole::Teacher {
        return Err(ApiError::Forbidden("Teacher access required"));
    }
    Ok(user)
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let State(app_state) = State::<AppState>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to access application state"))?;

        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthorized("Invalid authentication credentials"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized("Invalid authentication credentials"))?;

        authenticate(&app_state, token).map(CurrentUser)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentStudent {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        as_student(user).map(CurrentStudent)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentTeacher {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        as_teacher(user).map(CurrentTeacher)
    }
}

/// Loads the project and checks the caller owns it.
pub(crate) async fn require_project_owner(
    state: &AppState,
    teacher: &AuthUser,
    project_id: &str,
) -> Result<Project, ApiError> {
    let project = state
        .store()
        .find_project(project_id)
        .await
        .map_err(ExamError::from)?
        .ok_or(ExamError::NotFound("Project"))?;

    if project.owner_id != teacher.id {
        return Err(ApiError::Forbidden("Not the owner of this project"));
    }
    Ok(project)
}
