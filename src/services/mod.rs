pub(crate) mod artifact_registry;
pub(crate) mod assignment_mapping;
pub(crate) mod audit_trail;
pub(crate) mod filename;
pub(crate) mod lms;
pub(crate) mod retry_policy;
pub(crate) mod storage;
pub(crate) mod submission_protocol;
pub(crate) mod submission_queue;
