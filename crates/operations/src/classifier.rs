//! Mapping producer outcomes to terminal statuses

use buildops_config::ClassifierConfig;
use buildops_types::{FailureContext, OperationStatus, Outcome};
use std::collections::HashSet;

/// Terminal status plus whether the failure should propagate upward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status: OperationStatus,
    pub propagates_failure: bool,
}

/// Distinguishes expected (user-facing) failures from internal faults
///
/// A failure is expected when the producer flagged it so, or when its code
/// is in the configured set. Cancellation is always expected. Everything
/// else is an unexpected failure and is tagged for propagation.
#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    expected_codes: HashSet<String>,
}

impl FailureClassifier {
    #[must_use]
    pub fn new(expected_codes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            expected_codes: expected_codes.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(config.expected_codes.iter().cloned())
    }

    /// Whether a failure counts as expected
    #[must_use]
    pub fn is_expected(&self, failure: &FailureContext) -> bool {
        failure.expected
            || failure
                .code
                .as_ref()
                .is_some_and(|code| self.expected_codes.contains(code))
    }

    #[must_use]
    pub fn classify(&self, outcome: &Outcome) -> Classification {
        match outcome {
            Outcome::Succeeded { .. } => Classification {
                status: OperationStatus::Succeeded,
                propagates_failure: false,
            },
            Outcome::Cancelled { .. } => Classification {
                status: OperationStatus::FailedExpectedly,
                propagates_failure: false,
            },
            Outcome::Failed { failure } if self.is_expected(failure) => Classification {
                status: OperationStatus::FailedExpectedly,
                propagates_failure: false,
            },
            Outcome::Failed { .. } => Classification {
                status: OperationStatus::Failed,
                propagates_failure: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_codes_are_expected() {
        let classifier = FailureClassifier::from_config(&ClassifierConfig::default());
        let failure = FailureContext::unexpected("rejected").with_code("build.validation_failed");
        let classification = classifier.classify(&Outcome::failed(failure));
        assert_eq!(classification.status, OperationStatus::FailedExpectedly);
        assert!(!classification.propagates_failure);
    }

    #[test]
    fn unknown_failures_propagate() {
        let classifier = FailureClassifier::new(["build.cancelled"]);
        let failure = FailureContext::unexpected("segfault").with_code("build.internal");
        let classification = classifier.classify(&Outcome::failed(failure));
        assert_eq!(
            classification,
            Classification {
                status: OperationStatus::Failed,
                propagates_failure: true,
            }
        );
    }

    #[test]
    fn cancellation_and_flagged_failures_are_expected() {
        let classifier = FailureClassifier::default();
        assert_eq!(
            classifier.classify(&Outcome::cancelled("stop")).status,
            OperationStatus::FailedExpectedly
        );
        assert_eq!(
            classifier
                .classify(&Outcome::failed(FailureContext::expected("no such target")))
                .status,
            OperationStatus::FailedExpectedly
        );
        assert_eq!(
            classifier.classify(&Outcome::success()).status,
            OperationStatus::Succeeded
        );
    }
}
