use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "artifactstate", rename_all = "lowercase")]
pub(crate) enum ArtifactState {
    New,
    Assigned,
    Submitted,
    Archived,
}

impl ArtifactState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Assigned => "assigned",
            Self::Submitted => "submitted",
            Self::Archived => "archived",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "assigned" => Some(Self::Assigned),
            "submitted" => Some(Self::Submitted),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "submissionstate", rename_all = "snake_case")]
pub(crate) enum SubmissionState {
    Pending,
    Uploading,
    Saving,
    Submitting,
    RetryScheduled,
    Submitted,
    Failed,
}

impl SubmissionState {
    pub(crate) const TERMINAL: [SubmissionState; 2] = [Self::Submitted, Self::Failed];
    pub(crate) const IN_FLIGHT: [SubmissionState; 3] = [Self::Uploading, Self::Saving, Self::Submitting];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Saving => "saving",
            Self::Submitting => "submitting",
            Self::RetryScheduled => "retry_scheduled",
            Self::Submitted => "submitted",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "saving" => Some(Self::Saving),
            "submitting" => Some(Self::Submitting),
            "retry_scheduled" => Some(Self::RetryScheduled),
            "submitted" => Some(Self::Submitted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub(crate) fn is_in_flight(self) -> bool {
        Self::IN_FLIGHT.contains(&self)
    }
}

/// One call of the three-call LMS submission protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "protocolstep", rename_all = "lowercase")]
pub(crate) enum ProtocolStep {
    Upload,
    Save,
    Submit,
}

impl ProtocolStep {
    pub(crate) const ORDER: [ProtocolStep; 3] = [Self::Upload, Self::Save, Self::Submit];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Save => "save",
            Self::Submit => "submit",
        }
    }

    /// Request state while this step is executing.
    pub(crate) fn state(self) -> SubmissionState {
        match self {
            Self::Upload => SubmissionState::Uploading,
            Self::Save => SubmissionState::Saving,
            Self::Submit => SubmissionState::Submitting,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "failurekind", rename_all = "lowercase")]
pub(crate) enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_state_strings_roundtrip() {
        for state in [
            SubmissionState::Pending,
            SubmissionState::Uploading,
            SubmissionState::Saving,
            SubmissionState::Submitting,
            SubmissionState::RetryScheduled,
            SubmissionState::Submitted,
            SubmissionState::Failed,
        ] {
            assert_eq!(SubmissionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(serde_json::to_string(&SubmissionState::RetryScheduled).unwrap(), "\"retry_scheduled\"");
    }

    #[test]
    fn steps_map_to_in_flight_states() {
        assert!(ProtocolStep::ORDER.iter().all(|step| step.state().is_in_flight()));
        assert!(!SubmissionState::RetryScheduled.is_in_flight());
        assert!(SubmissionState::Failed.is_terminal());
    }
}
