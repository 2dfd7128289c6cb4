//! Listener-side error types

use std::borrow::Cow;

use crate::UserFacingError;
use thiserror::Error;

/// Raised by a listener while handling an event.
///
/// These never reach the producer; the dispatcher reports them to its
/// diagnostic sink and moves on to the next listener.
#[derive(Debug, Clone, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum ListenerError {
    #[error("listener failed: {message}")]
    Failed { message: String },

    #[error("listener panicked: {message}")]
    Panicked { message: String },

    #[error("event channel closed")]
    ChannelClosed,
}

impl ListenerError {
    /// Create a generic listener failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl UserFacingError for ListenerError {
    fn user_message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }

    fn user_code(&self) -> Option<&'static str> {
        Some(match self {
            Self::Failed { .. } => "listener.failed",
            Self::Panicked { .. } => "listener.panicked",
            Self::ChannelClosed => "listener.channel_closed",
        })
    }
}
