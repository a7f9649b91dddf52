use std::time::Duration;

use crate::db::types::{FailureKind, ProtocolStep};
use crate::services::lms::ExternalFailure;
use crate::services::retry_policy::RetryDecision;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FailurePlan {
    Retry { delay: Duration, result_detail: String },
    Fail { result_detail: String },
}

/// Turns a retry decision into the request's next state and the summary shown to the student.
pub(crate) fn plan_failure(
    decision: RetryDecision,
    failure: &ExternalFailure,
    step: ProtocolStep,
    attempt_count: u32,
    max_attempts: u32,
) -> FailurePlan {
    let step = step.as_str();
    let reason = &failure.reason;

    match (decision, failure.kind) {
        (RetryDecision::Continue { delay }, _) => FailurePlan::Retry {
            delay,
            result_detail: format!(
                "Attempt {attempt_count} of {max_attempts} failed at the {step} step ({reason}); \
                 retrying in {}s",
                delay.as_secs()
            ),
        },
        (RetryDecision::GiveUp, FailureKind::Transient) => FailurePlan::Fail {
            result_detail: format!(
                "Submission failed after {attempt_count} attempts at the {step} step ({reason}). \
                 The LMS was unavailable; please submit again later."
            ),
        },
        (RetryDecision::GiveUp, FailureKind::Permanent) => FailurePlan::Fail {
            result_detail: format!(
                "Submission was rejected at the {step} step ({reason}). \
                 Please contact exam staff."
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_summary_names_step_and_delay() {
        let plan = plan_failure(
            RetryDecision::Continue { delay: Duration::from_secs(31) },
            &ExternalFailure::transient("http_503"),
            ProtocolStep::Save,
            1,
            3,
        );
        assert_eq!(
            plan,
            FailurePlan::Retry {
                delay: Duration::from_secs(31),
                result_detail: "Attempt 1 of 3 failed at the save step (http_503); retrying in 31s"
                    .to_string(),
            }
        );
    }

    #[test]
    fn exhausted_transient_failures_ask_for_a_later_retry() {
        let FailurePlan::Fail { result_detail } = plan_failure(
            RetryDecision::GiveUp,
            &ExternalFailure::transient("timeout"),
            ProtocolStep::Upload,
            3,
            3,
        ) else {
            panic!("expected failure");
        };
        assert!(result_detail.contains("after 3 attempts"));
        assert!(result_detail.contains("submit again later"));
        assert!(!result_detail.contains("contact exam staff"));
    }

    #[test]
    fn permanent_failures_point_to_staff() {
        let FailurePlan::Fail { result_detail } = plan_failure(
            RetryDecision::GiveUp,
            &ExternalFailure::permanent("invalidtoken"),
            ProtocolStep::Submit,
            1,
            3,
        ) else {
            panic!("expected failure");
        };
        assert!(result_detail.contains("contact exam staff"));
        assert!(result_detail.contains("invalidtoken"));
    }
}
