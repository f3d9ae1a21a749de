use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Join rejected because the mesh is at capacity. User-facing, no retry.
    #[error("Mesh capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The addressed peer has no live transport session. Surfaced, no retry.
    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    /// Local media acquisition failed; the join is aborted.
    #[error("Media permission denied: {0}")]
    MediaPermissionDenied(String),

    /// Surfaced only after the escalation ladder exhausts for one peer.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Malformed message; the relay rejects without forwarding.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may reasonably retry the failed operation.
    ///
    /// Capacity and target-unavailable rejections are final by contract; the
    /// caller must re-initiate from the top if circumstances change.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors_not_retryable() {
        assert!(!Error::CapacityExceeded("full".to_string()).is_retryable());
        assert!(!Error::TargetUnavailable("gone".to_string()).is_retryable());
        assert!(!Error::MediaPermissionDenied("denied".to_string()).is_retryable());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err = serde_json::from_str::<String>("{not json").unwrap_err();
        let converted: Error = err.into();
        assert!(matches!(converted, Error::Serialization(_)));
    }
}
