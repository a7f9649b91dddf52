use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::SubjectMapping;

#[derive(Debug, Serialize)]
pub(crate) struct MappingResponse {
    pub(crate) subject_code: String,
    pub(crate) lms_course_id: Option<i64>,
    pub(crate) lms_assignment_id: i64,
    pub(crate) assignment_name: Option<String>,
    pub(crate) source: String,
    pub(crate) is_active: bool,
    pub(crate) updated_at: String,
}

impl MappingResponse {
    pub(crate) fn from_db(mapping: SubjectMapping) -> Self {
        Self {
            subject_code: mapping.subject_code,
            lms_course_id: mapping.lms_course_id,
            lms_assignment_id: mapping.lms_assignment_id,
            assignment_name: mapping.assignment_name,
            source: mapping.source,
            is_active: mapping.is_active,
            updated_at: format_primitive(mapping.updated_at),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct MappingUpsertRequest {
    #[validate(range(min = 1, message = "lms_course_id must be positive"))]
    #[serde(default)]
    pub(crate) lms_course_id: Option<i64>,
    #[validate(range(min = 1, message = "lms_assignment_id must be positive"))]
    pub(crate) lms_assignment_id: i64,
    #[validate(length(max = 255, message = "assignment_name is too long"))]
    #[serde(default)]
    pub(crate) assignment_name: Option<String>,
    #[serde(default = "default_active")]
    pub(crate) is_active: bool,
}

fn default_active() -> bool {
    true
}
