//! Error taxonomy for the chat core.

/// Fallback reason when the server rejects a request without saying why.
pub const GENERIC_REJECTION: &str = "request rejected by server";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// No credential available, or the server refused it. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    #[error("join rejected: {0}")]
    JoinRejected(String),

    #[error("send rejected: {0}")]
    SendRejected(String),

    /// The server sent something the client could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure from the REST collaborator.
    #[error("api error: {0}")]
    Api(String),
}

impl ChatError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Auth(_) => "auth",
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::NotConnected => "not_connected",
            Self::JoinRejected(_) => "join_rejected",
            Self::SendRejected(_) => "send_rejected",
            Self::Protocol(_) => "protocol",
            Self::Api(_) => "api",
        }
    }

    /// Transient failures feed the reconnection policy; the rest are surfaced
    /// to the caller as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout | Self::NotConnected)
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
