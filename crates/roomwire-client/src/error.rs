use roomwire_core::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected")]
    Disconnected,

    /// Failure reported by the server or a remote handler; the text is
    /// passed through untouched.
    #[error("{0}")]
    Remote(String),

    #[error("session has left the room")]
    Left,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// Whether the failure came from the other end rather than the link.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}
