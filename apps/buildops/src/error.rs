//! CLI error handling

use std::fmt;

use buildops_errors::UserFacingError;

/// CLI-specific error type
#[derive(Debug)]
pub enum CliError {
    /// Tracker or configuration error
    Ops(buildops_errors::Error),
    /// Invalid command arguments
    InvalidArguments(String),
    /// Background task died
    Task(String),
    /// I/O error
    Io(std::io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Ops(e) => {
                let message = e.user_message();
                write!(f, "{message}")?;
                if let Some(code) = e.user_code() {
                    write!(f, "\n  Code: {code}")?;
                }
                if let Some(hint) = e.user_hint() {
                    write!(f, "\n  Hint: {hint}")?;
                }
                if e.is_retryable() {
                    write!(f, "\n  Retry: safe to retry this operation.")?;
                }
                Ok(())
            }
            CliError::InvalidArguments(msg) => write!(f, "Invalid arguments: {msg}"),
            CliError::Task(msg) => write!(f, "Background task failed: {msg}"),
            CliError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Ops(e) => Some(e),
            CliError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<buildops_errors::Error> for CliError {
    fn from(e: buildops_errors::Error) -> Self {
        CliError::Ops(e)
    }
}

impl From<buildops_errors::ConfigError> for CliError {
    fn from(e: buildops_errors::ConfigError) -> Self {
        CliError::Ops(e.into())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e)
    }
}

impl From<tokio::task::JoinError> for CliError {
    fn from(e: tokio::task::JoinError) -> Self {
        CliError::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildops_errors::OperationError;

    #[test]
    fn ops_errors_render_code() {
        let err = CliError::from(buildops_errors::Error::from(
            OperationError::AlreadyFinished {
                id: 4,
                status: "succeeded".into(),
            },
        ));
        let text = err.to_string();
        assert!(text.contains("#4"));
        assert!(text.contains("Code: operation.already_finished"));
    }
}
