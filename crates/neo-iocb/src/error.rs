//! Error types for IOCB dispatch.

/// Errors that terminate a control block or signal misuse of a controller.
///
/// Every variant except `ProtocolViolation` reaches the application through a
/// block's terminal error state. `ProtocolViolation` is reported to whoever
/// drove the controller (normally the transport) and logged there.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IocbError {
    #[error("timeout")]
    Timeout,

    #[error("Transport abort: {0}")]
    TransportAbort(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    #[error("Controller already registered: {0}")]
    AlreadyRegistered(String),
}

impl IocbError {
    /// Build a transport failure from any displayable error
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::TransportAbort(err.to_string())
    }

    /// Build a caller-initiated abort
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted(reason.into())
    }

    /// Whether this error came from a deferred timeout firing
    pub fn is_timeout(&self) -> bool {
        matches!(self, IocbError::Timeout)
    }
}

/// Result type for IOCB operations
pub type IocbResult<T> = Result<T, IocbError>;
