use speechrelay_core::{engine::EngineError, identity::IdentityError};
use uuid::Uuid;

/// Failures of the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("client {0} is not registered")]
    NotFound(Uuid),
    #[error("outbound queue of client {0} is full")]
    QueueFull(Uuid),
    #[error("outbound queue of client {0} is closed")]
    Closed(Uuid),
    #[error("registry control loop has stopped")]
    Stopped,
}

/// Errors raised while serving a client connection.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("handshake rejected: {0}")]
    Handshake(#[from] IdentityError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("routing error: {0}")]
    Routing(String),
    #[error("no active speech session for client {0}")]
    SessionNotFound(Uuid),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("network error: {0}")]
    Network(String),
    #[error(transparent)]
    Delivery(#[from] HubError),
}

impl WsError {
    /// Stable label used by the error counter.
    pub fn category(&self) -> &'static str {
        match self {
            WsError::Handshake(_) => "handshake",
            WsError::ProtocolViolation(_) => "protocol",
            WsError::Routing(_) => "routing",
            WsError::SessionNotFound(_) => "session_not_found",
            WsError::Engine(_) => "engine",
            WsError::Network(_) => "network",
            WsError::Delivery(_) => "delivery",
        }
    }

    /// Connection-level errors terminate the connection; the rest are
    /// reported to the client and the connection survives.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WsError::Handshake(_) | WsError::ProtocolViolation(_) | WsError::Network(_)
        )
    }
}
