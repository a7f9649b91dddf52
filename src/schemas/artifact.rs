use serde::{Deserialize, Serialize};

use crate::core::time::format_primitive;
use crate::db::models::Artifact;
use crate::db::types::ArtifactState;
use crate::schemas::submission::SubmissionResponse;

#[derive(Debug, Serialize)]
pub(crate) struct ArtifactResponse {
    pub(crate) id: String,
    pub(crate) register_number: String,
    pub(crate) subject_code: String,
    pub(crate) exam_session: String,
    pub(crate) original_filename: String,
    pub(crate) file_extension: String,
    pub(crate) mime_type: String,
    pub(crate) file_size_bytes: i64,
    pub(crate) file_hash: String,
    pub(crate) state: ArtifactState,
    pub(crate) uploaded_by: String,
    pub(crate) uploaded_at: String,
    pub(crate) updated_at: String,
}

impl ArtifactResponse {
    pub(crate) fn from_db(artifact: Artifact) -> Self {
        Self {
            id: artifact.id,
            register_number: artifact.register_number,
            subject_code: artifact.subject_code,
            exam_session: artifact.exam_session,
            original_filename: artifact.original_filename,
            file_extension: artifact.file_extension,
            mime_type: artifact.mime_type,
            file_size_bytes: artifact.file_size_bytes,
            file_hash: artifact.file_hash,
            state: artifact.state,
            uploaded_by: artifact.uploaded_by,
            uploaded_at: format_primitive(artifact.uploaded_at),
            updated_at: format_primitive(artifact.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ArtifactDetailResponse {
    pub(crate) artifact: ArtifactResponse,
    pub(crate) submissions: Vec<SubmissionResponse>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ArtifactSearchQuery {
    pub(crate) register_number: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ArtifactStatsResponse {
    pub(crate) total: i64,
    pub(crate) by_state: Vec<ArtifactStateCount>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ArtifactStateCount {
    pub(crate) state: ArtifactState,
    pub(crate) count: i64,
}
