pub(crate) mod artifacts;
pub(crate) mod audit_events;
pub(crate) mod subject_mappings;
pub(crate) mod submission_requests;
