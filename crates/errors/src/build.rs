//! Build work error types
//!
//! Failures raised by the work that runs inside a build operation. They are
//! what the failure classifier sees when a scoped operation returns `Err`.

use std::borrow::Cow;

use crate::UserFacingError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum BuildError {
    #[error("validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("fetch failed: {url}")]
    FetchFailed { url: String },

    #[error("file operation failed on {path}: {message}")]
    FileOperationFailed { path: String, message: String },

    #[error("build timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("build cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("internal build fault: {message}")]
    Internal { message: String },
}

impl UserFacingError for BuildError {
    fn user_message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }

    fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::ValidationFailed { .. } => {
                Some("Fix the reported build inputs and run the build again.")
            }
            Self::FetchFailed { .. } => {
                Some("Check network access or provide local copies of the fetched artifacts.")
            }
            Self::Timeout { .. } => Some("Increase the build timeout or reduce parallelism."),
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::Timeout { .. })
    }

    fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed { .. } | Self::TaskFailed { .. } | Self::Cancelled { .. }
        )
    }

    fn user_code(&self) -> Option<&'static str> {
        let code = match self {
            Self::ValidationFailed { .. } => "build.validation_failed",
            Self::TaskFailed { .. } => "build.task_failed",
            Self::FetchFailed { .. } => "build.fetch_failed",
            Self::FileOperationFailed { .. } => "build.file_operation_failed",
            Self::Timeout { .. } => "build.timeout",
            Self::Cancelled { .. } => "build.cancelled",
            Self::Internal { .. } => "build.internal",
        };
        Some(code)
    }
}
