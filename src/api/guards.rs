use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::{header, request::Parts};

use crate::api::errors::ApiError;
use crate::core::security::{self, SecretToken};
use crate::core::state::AppState;
use crate::services::lms::CallContext;

/// Exam staff authenticated by a JWT from the staff-auth service.
pub(crate) struct StaffUser {
    pub(crate) actor: String,
}

/// A student whose LMS token was accepted by the LMS itself.
pub(crate) struct StudentUser {
    pub(crate) register_number: String,
    pub(crate) token: SecretToken,
}

impl StudentUser {
    pub(crate) fn actor(&self) -> String {
        format!("student:{}", self.register_number)
    }
}

/// Either kind of caller, for read endpoints shared by staff and students.
pub(crate) enum Caller {
    Staff(StaffUser),
    Student(StudentUser),
}

fn bearer(parts: &Parts) -> Result<&str, ApiError> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::Unauthorized("Invalid authentication credentials"))
}

async fn app_state(parts: &mut Parts, state: &AppState) -> Result<AppState, ApiError> {
    let State(app_state) = State::<AppState>::from_request_parts(parts, state)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to access application state"))?;
    Ok(app_state)
}

fn staff_from_token(token: &str, state: &AppState) -> Result<StaffUser, ApiError> {
    let claims = security::verify_token(token, state.settings())
        .map_err(|_| ApiError::Unauthorized("Invalid authentication credentials"))?;

    if !claims.is_staff() {
        return Err(ApiError::Forbidden("Staff access required"));
    }
    Ok(StaffUser { actor: format!("staff:{}", claims.sub) })
}

async fn student_from_token(token: &str, state: &AppState) -> Result<StudentUser, ApiError> {
    let token = SecretToken::new(token);
    let user = state.lms().site_user(&CallContext::student(token.clone())).await.map_err(
        |failure| {
            if failure.is_transient() {
                ApiError::ServiceUnavailable("LMS is unavailable; try again shortly".to_string())
            } else {
                tracing::info!(reason = %failure.reason, "Student token rejected by the LMS");
                ApiError::Unauthorized("Invalid authentication credentials")
            }
        },
    )?;

    Ok(StudentUser { register_number: user.username.trim().to_string(), token })
}

#[async_trait]
impl FromRequestParts<AppState> for StaffUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let app_state = app_state(parts, state).await?;
        staff_from_token(bearer(parts)?, &app_state)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for StudentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let app_state = app_state(parts, state).await?;
        student_from_token(bearer(parts)?, &app_state).await
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let app_state = app_state(parts, state).await?;
        let token = bearer(parts)?;

        // Staff JWTs verify locally; anything else is tried against the LMS.
        if security::verify_token(token, app_state.settings()).is_ok() {
            return staff_from_token(token, &app_state).map(Caller::Staff);
        }
        student_from_token(token, &app_state).await.map(Caller::Student)
    }
}

/// Students may only act on artifacts named with their own register number.
pub(crate) fn require_owner(student: &StudentUser, register_number: &str) -> Result<(), ApiError> {
    if student.register_number == register_number {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Artifact belongs to another student"))
    }
}
