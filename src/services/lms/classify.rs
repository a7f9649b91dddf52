use reqwest::StatusCode;

use crate::db::types::FailureKind;

use super::ExternalFailure;

/// Moodle exception codes that describe a temporary server condition.
const TRANSIENT_ERRORCODES: &[&str] = &[
    "sitemaintenance",
    "dmlreadexception",
    "dmlwriteexception",
    "dmltransactionexception",
    "dbsessionhandlerproblem",
    "cannotgetlock",
];

/// `None` for 2xx; otherwise the failure class of an HTTP status.
pub(crate) fn classify_status(status: StatusCode) -> Option<FailureKind> {
    if status.is_success() {
        return None;
    }

    match status.as_u16() {
        408 | 425 | 429 => Some(FailureKind::Transient),
        400..=499 => Some(FailureKind::Permanent),
        _ => Some(FailureKind::Transient),
    }
}

pub(crate) fn classify_errorcode(errorcode: &str) -> FailureKind {
    if TRANSIENT_ERRORCODES.contains(&errorcode.to_ascii_lowercase().as_str()) {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

pub(super) fn from_transport(err: &reqwest::Error) -> ExternalFailure {
    if err.is_timeout() {
        ExternalFailure::transient("timeout")
    } else if err.is_connect() {
        ExternalFailure::transient("connect")
    } else if err.is_builder() {
        ExternalFailure::permanent("request_build")
    } else if err.is_body() || err.is_decode() {
        ExternalFailure::transient("response_body")
    } else {
        ExternalFailure::transient("network")
    }
}

pub(super) fn from_status(status: StatusCode) -> Option<ExternalFailure> {
    classify_status(status)
        .map(|kind| ExternalFailure { kind, reason: format!("http_{}", status.as_u16()) })
}

pub(super) fn from_errorcode(errorcode: &str) -> ExternalFailure {
    let code = if errorcode.is_empty() { "unknown_exception" } else { errorcode };
    ExternalFailure { kind: classify_errorcode(code), reason: code.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_split_into_transient_and_permanent() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), Some(FailureKind::Transient));
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Some(FailureKind::Transient));
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), Some(FailureKind::Transient));
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), Some(FailureKind::Transient));
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), Some(FailureKind::Transient));
        assert_eq!(classify_status(StatusCode::FORBIDDEN), Some(FailureKind::Permanent));
        assert_eq!(classify_status(StatusCode::NOT_FOUND), Some(FailureKind::Permanent));
        assert_eq!(classify_status(StatusCode::PAYLOAD_TOO_LARGE), Some(FailureKind::Permanent));
    }

    #[test]
    fn moodle_errorcodes_default_to_permanent() {
        assert_eq!(classify_errorcode("invalidtoken"), FailureKind::Permanent);
        assert_eq!(classify_errorcode("invalidrecord"), FailureKind::Permanent);
        assert_eq!(classify_errorcode("nopermissions"), FailureKind::Permanent);
        assert_eq!(classify_errorcode("sitemaintenance"), FailureKind::Transient);
        assert_eq!(classify_errorcode("DMLWriteException"), FailureKind::Transient);
    }

    #[test]
    fn status_failure_reason_names_the_code() {
        let failure = from_status(StatusCode::BAD_GATEWAY).expect("failure");
        assert!(failure.is_transient());
        assert_eq!(failure.reason, "http_502");
        assert_eq!(from_errorcode("").reason, "unknown_exception");
    }
}
