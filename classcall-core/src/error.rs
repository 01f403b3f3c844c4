//! Error types for classroom calls

use thiserror::Error;

/// Main error type for call setup and negotiation
#[derive(Error, Debug)]
pub enum ClassCallError {
    /// Initialization error
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Reason for initialization failure
        reason: String,
    },

    /// Missing configuration error
    #[error("Missing required configuration: {field}")]
    MissingConfiguration {
        /// Missing configuration field
        field: String,
    },

    /// Media transport endpoint rejected an operation
    #[error("Transport error during {operation}: {reason}")]
    Transport {
        /// Operation that failed (create_offer, set_remote_description, ...)
        operation: String,
        /// Reason reported by the transport
        reason: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Signaling channel could not be opened
    #[error("Signaling channel to {url} failed: {reason}")]
    ChannelConnect {
        /// Channel URL
        url: String,
        /// Reason for failure
        reason: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {message}, error: {source}")]
    InvalidMessage {
        /// Invalid message content
        message: String,
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Session directory (REST backend) request failed
    #[error("Session directory {operation} failed: {reason}")]
    Directory {
        /// Directory operation
        operation: String,
        /// Reason for failure
        reason: String,
        /// HTTP status when the backend answered
        status: Option<u16>,
    },

    /// Session not found
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// Session ID that was not found
        session_id: String,
    },

    /// Session is no longer active
    #[error("Session {session_id} is not active")]
    SessionNotActive {
        /// Session ID
        session_id: String,
    },

    /// Caller lacks the role required for an operation
    #[error("User {user_id} is not allowed to {operation}")]
    NotAuthorized {
        /// User ID
        user_id: String,
        /// Operation that was refused
        operation: String,
    },
}

impl ClassCallError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            ClassCallError::Initialization { .. } => "INITIALIZATION_FAILED".to_string(),
            ClassCallError::MissingConfiguration { .. } => "MISSING_CONFIGURATION".to_string(),
            ClassCallError::Transport { .. } => "TRANSPORT_ERROR".to_string(),
            ClassCallError::InvalidState { .. } => "INVALID_STATE".to_string(),
            ClassCallError::ChannelConnect { .. } => "CHANNEL_CONNECT_FAILED".to_string(),
            ClassCallError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
            ClassCallError::Directory { .. } => "DIRECTORY_ERROR".to_string(),
            ClassCallError::SessionNotFound { .. } => "SESSION_NOT_FOUND".to_string(),
            ClassCallError::SessionNotActive { .. } => "SESSION_NOT_ACTIVE".to_string(),
            ClassCallError::NotAuthorized { .. } => "NOT_AUTHORIZED".to_string(),
        }
    }

    /// Whether retrying the call setup can reasonably succeed.
    ///
    /// Channel and directory failures are transient; configuration and
    /// authorization problems are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClassCallError::Transport { .. }
                | ClassCallError::ChannelConnect { .. }
                | ClassCallError::Directory { .. }
        )
    }

    pub(crate) fn transport(operation: &str, reason: impl ToString) -> Self {
        ClassCallError::Transport {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias used across the workspace
pub type Result<T> = std::result::Result<T, ClassCallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(ClassCallError::transport("create_offer", "no tracks").is_recoverable());
        assert!(ClassCallError::Directory {
            operation: "join".to_string(),
            reason: "503".to_string(),
            status: Some(503),
        }
        .is_recoverable());

        let refused = ClassCallError::NotAuthorized {
            user_id: "7".to_string(),
            operation: "create_session".to_string(),
        };
        assert!(!refused.is_recoverable());
        assert_eq!(refused.error_code(), "NOT_AUTHORIZED");

        let missing = ClassCallError::MissingConfiguration {
            field: "turn_url".to_string(),
        };
        assert!(!missing.is_recoverable());
        assert_eq!(missing.to_string(), "Missing required configuration: turn_url");
    }
}
