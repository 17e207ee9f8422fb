//! Error types for the record service.

use thiserror::Error;
use zonesync_protocol::ZoneId;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors the record service reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The zone does not exist.
    #[error("zone {0} not found")]
    ZoneNotFound(ZoneId),

    /// A request carried more items than the service accepts.
    #[error("batch of {size} items exceeds the limit of {max}")]
    BatchTooLarge {
        /// Items in the rejected request.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A change token the service did not issue.
    #[error("invalid change token: {0}")]
    InvalidToken(String),

    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if the caller sent something the service rejects.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::ZoneNotFound(_)
                | ServerError::BatchTooLarge { .. }
                | ServerError::InvalidToken(_)
                | ServerError::InvalidRequest(_)
        )
    }

    /// Returns true if the failure is on the service side.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidToken("x".into()).is_client_error());
        assert!(ServerError::ZoneNotFound(ZoneId::new("z")).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn error_display() {
        let err = ServerError::BatchTooLarge { size: 150, max: 100 };
        let msg = err.to_string();
        assert!(msg.contains("150"));
        assert!(msg.contains("100"));
    }
}
