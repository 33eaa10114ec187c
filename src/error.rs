//! Error categories for the labeling core.
//!
//! Validation problems are raised before any network call and are never
//! retried. Backend failures are retried by [`crate::retry`]; once every
//! attempt is spent they become terminal and carry the last cause.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabelError {
    /// Input rejected before any backend was contacted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Required fields absent from the input dataset.
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    /// A single embedding or model call failed; eligible for retry.
    #[error("backend call failed: {0}")]
    TransientBackend(String),

    /// The embedding backend gave up after its attempt ceiling.
    #[error("embedding failed after {attempts} attempts: {last_cause}")]
    EmbeddingExhausted { attempts: u32, last_cause: String },

    /// Every configured model/attempt combination failed for one conversation.
    #[error("labeling failed after {attempts} attempts: {last_cause}")]
    TerminalLabeling { attempts: u32, last_cause: String },
}

impl LabelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientBackend(msg.into())
    }

    /// True for errors raised before any backend call.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::MissingFields(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_lists_every_name() {
        let err = LabelError::MissingFields(vec!["thread_id".into(), "message_concat".into()]);
        assert_eq!(
            err.to_string(),
            "missing required fields: thread_id, message_concat"
        );
        assert!(err.is_validation());
    }

    #[test]
    fn terminal_error_names_last_cause() {
        let err = LabelError::TerminalLabeling {
            attempts: 6,
            last_cause: "HTTP 503".into(),
        };
        assert!(err.to_string().contains("HTTP 503"));
        assert!(!err.is_validation());
    }
}
