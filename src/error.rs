//! Error handling for the chat server

use thiserror::Error;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat server error types
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),
    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Login refused or an action the sender is not entitled to
    #[error("Not authorized: {0}")]
    Auth(String),
    /// Framing violations that cannot be recovered from
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),
    /// Well-formed frame with unusable addressing or fields
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    /// User not found
    #[error("User not found: {0}")]
    UserNotFound(String),
    /// Group not found
    #[error("Group not found: {0}")]
    GroupNotFound(String),
    /// File storage failure
    #[error("Storage error: {0}")]
    Storage(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Server internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Whether a decoder can keep going after this error.
    ///
    /// A malformed payload only costs the frame it arrived in; anything else
    /// leaves the byte stream in an unknown position.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChatError::Serialization(_))
    }

    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        ChatError::Network(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        ChatError::Serialization(msg.into())
    }

    /// Create an authentication error
    pub fn auth<T: Into<String>>(msg: T) -> Self {
        ChatError::Auth(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ChatError::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        ChatError::Connection(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message<T: Into<String>>(msg: T) -> Self {
        ChatError::InvalidMessage(msg.into())
    }

    /// Create a user not found error
    pub fn user_not_found<T: Into<String>>(msg: T) -> Self {
        ChatError::UserNotFound(msg.into())
    }

    /// Create a group not found error
    pub fn group_not_found<T: Into<String>>(msg: T) -> Self {
        ChatError::GroupNotFound(msg.into())
    }

    /// Create a storage error
    pub fn storage<T: Into<String>>(msg: T) -> Self {
        ChatError::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChatError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ChatError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Network(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Serialization(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ChatError::user_not_found("bob");
        assert_eq!(err.to_string(), "User not found: bob");

        let err = ChatError::storage("disk full");
        assert_eq!(err.to_string(), "Storage error: disk full");
    }

    #[test]
    fn test_only_serialization_is_recoverable() {
        assert!(ChatError::serialization("bad json").is_recoverable());
        assert!(!ChatError::protocol("frame too large").is_recoverable());
        assert!(!ChatError::network("reset").is_recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ChatError = io.into();
        assert!(matches!(err, ChatError::Network(_)));
        assert!(err.to_string().contains("pipe"));
    }
}
