//! Boundary to the external LMS. Every call carries its own credentials and reports failures only
//! as [`FailureKind`] plus a short machine-readable reason.

mod classify;
mod moodle;

use std::fmt;

use async_trait::async_trait;

use crate::core::security::SecretToken;
use crate::db::types::FailureKind;

pub(crate) use moodle::MoodleClient;

/// Draft-area item id returned by an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHandle(pub(crate) i64);

/// Credentials for a single LMS call.
#[derive(Debug, Clone, Default)]
pub(crate) struct CallContext {
    pub(crate) student: Option<SecretToken>,
    pub(crate) service: Option<SecretToken>,
}

impl CallContext {
    pub(crate) fn student(token: SecretToken) -> Self {
        Self { student: Some(token), service: None }
    }

    pub(crate) fn service(token: SecretToken) -> Self {
        Self { student: None, service: Some(token) }
    }

    pub(crate) fn student_token(&self) -> Result<&SecretToken, ExternalFailure> {
        self.student
            .as_ref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ExternalFailure::permanent("missing_student_token"))
    }

    pub(crate) fn service_token(&self) -> Result<&SecretToken, ExternalFailure> {
        self.service
            .as_ref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ExternalFailure::permanent("missing_service_token"))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct UploadFile {
    pub(crate) filename: String,
    pub(crate) mime_type: String,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RemoteSubmissionStatus {
    New,
    Draft,
    Submitted,
    Other(String),
}

impl RemoteSubmissionStatus {
    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "new" => Self::New,
            "draft" => Self::Draft,
            "submitted" => Self::Submitted,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SiteUser {
    pub(crate) user_id: i64,
    pub(crate) username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DiscoveredAssignment {
    pub(crate) course_id: i64,
    pub(crate) course_shortname: String,
    pub(crate) assignment_id: i64,
    pub(crate) name: String,
}

/// Classified LMS failure. `reason` never contains credentials or raw response bodies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} LMS failure: {reason}")]
pub(crate) struct ExternalFailure {
    pub(crate) kind: FailureKind,
    pub(crate) reason: String,
}

impl ExternalFailure {
    pub(crate) fn transient(reason: impl Into<String>) -> Self {
        Self { kind: FailureKind::Transient, reason: reason.into() }
    }

    pub(crate) fn permanent(reason: impl Into<String>) -> Self {
        Self { kind: FailureKind::Permanent, reason: reason.into() }
    }

    pub(crate) fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub(crate) trait LmsGateway: Send + Sync {
    /// Step 1: places the bytes in the student's draft area.
    async fn upload(&self, ctx: &CallContext, file: &UploadFile)
        -> Result<FileHandle, ExternalFailure>;

    /// Step 2: attaches the draft file to the assignment submission.
    async fn save_draft(
        &self,
        ctx: &CallContext,
        assignment_id: i64,
        handle: FileHandle,
    ) -> Result<(), ExternalFailure>;

    /// Step 3: finalises the submission for grading.
    async fn submit_for_grading(
        &self,
        ctx: &CallContext,
        assignment_id: i64,
    ) -> Result<(), ExternalFailure>;

    async fn handle_is_valid(
        &self,
        ctx: &CallContext,
        handle: FileHandle,
    ) -> Result<bool, ExternalFailure>;

    async fn submission_status(
        &self,
        ctx: &CallContext,
        assignment_id: i64,
    ) -> Result<RemoteSubmissionStatus, ExternalFailure>;

    /// Resolves the account behind the student token.
    async fn site_user(&self, ctx: &CallContext) -> Result<SiteUser, ExternalFailure>;

    /// Lists assignments visible to the service credential.
    async fn list_assignments(
        &self,
        ctx: &CallContext,
    ) -> Result<Vec<DiscoveredAssignment>, ExternalFailure>;
}
