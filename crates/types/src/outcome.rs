//! Terminal outcomes reported by producers

use buildops_errors::UserFacingError;
use serde::{Deserialize, Serialize};

/// Structured failure information attached to a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Stable error code, when the error has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Short user-facing message.
    pub message: String,
    /// Optional remediation hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Whether retrying the operation might succeed.
    pub retryable: bool,
    /// Whether the producer recognised the failure as user-facing.
    #[serde(default)]
    pub expected: bool,
}

impl FailureContext {
    /// Construct a new failure context.
    #[must_use]
    pub fn new(
        code: Option<impl Into<String>>,
        message: impl Into<String>,
        hint: Option<impl Into<String>>,
        retryable: bool,
    ) -> Self {
        Self {
            code: code.map(Into::into),
            message: message.into(),
            hint: hint.map(Into::into),
            retryable,
            expected: false,
        }
    }

    /// An internal fault with only a message.
    #[must_use]
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(None::<String>, message, None::<String>, false)
    }

    /// A recognised, user-facing failure with only a message.
    #[must_use]
    pub fn expected(message: impl Into<String>) -> Self {
        Self {
            expected: true,
            ..Self::unexpected(message)
        }
    }

    /// Attach a stable error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Build failure context from a `UserFacingError` implementation.
    #[must_use]
    pub fn from_error<E: UserFacingError + ?Sized>(error: &E) -> Self {
        Self {
            expected: error.is_expected(),
            ..Self::new(
                error.user_code(),
                error.user_message().into_owned(),
                error.user_hint(),
                error.is_retryable(),
            )
        }
    }
}

/// How a producer says an operation ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    Failed { failure: FailureContext },
    /// Producer-driven cancellation; classified as an expected failure.
    Cancelled { reason: String },
}

impl Outcome {
    #[must_use]
    pub fn success() -> Self {
        Self::Succeeded { result: None }
    }

    #[must_use]
    pub fn success_with(result: serde_json::Value) -> Self {
        Self::Succeeded {
            result: Some(result),
        }
    }

    #[must_use]
    pub fn failed(failure: FailureContext) -> Self {
        Self::Failed { failure }
    }

    /// Failure outcome built from any user-facing error
    #[must_use]
    pub fn from_error<E: UserFacingError + ?Sized>(error: &E) -> Self {
        Self::failed(FailureContext::from_error(error))
    }

    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildops_errors::BuildError;

    #[test]
    fn failure_context_from_error_keeps_expectation() {
        let err = BuildError::ValidationFailed {
            message: "bad input".into(),
        };
        let ctx = FailureContext::from_error(&err);
        assert!(ctx.expected);
        assert_eq!(ctx.code.as_deref(), Some("build.validation_failed"));
        assert_eq!(ctx.message, "validation failed: bad input");
        assert!(ctx.hint.is_some());
    }

    #[test]
    fn outcome_is_tagged() {
        let json = serde_json::to_value(Outcome::cancelled("user interrupt")).unwrap();
        assert_eq!(json["outcome"], "cancelled");
        assert_eq!(json["reason"], "user interrupt");
    }
}
