use crate::policy::InvokePolicy;

/// Failures of the RPC broker. The `Display` text is exactly what crosses
/// the wire in an `{"err": ...}` outcome.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("Function {name} is not registered")]
    NotRegistered { name: String },

    #[error("Function {name} is registered with invoke policy {existing}, not {requested}")]
    PolicyConflict {
        name: String,
        existing: InvokePolicy,
        requested: InvokePolicy,
    },

    #[error("Function {name} is already registered")]
    AlreadyRegistered { name: String },

    /// The callee's handler failed; carries its textual description.
    #[error("{0}")]
    Handler(String),

    #[error("Function {name} owner disconnected")]
    CalleeDisconnected { name: String },

    #[error("Function {name} timed out")]
    Timeout { name: String },
}

impl RpcError {
    pub fn not_registered(name: impl Into<String>) -> Self {
        Self::NotRegistered { name: name.into() }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotRegistered { .. } => "not_registered",
            Self::PolicyConflict { .. } => "policy_conflict",
            Self::AlreadyRegistered { .. } => "already_registered",
            Self::Handler(_) => "handler_error",
            Self::CalleeDisconnected { .. } => "callee_disconnected",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Malformed inbound traffic. Never fatal to a connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("invalid payload for {event}: {message}")]
    InvalidPayload { event: String, message: String },

    #[error("unsupported frame: {0}")]
    Unsupported(String),

    #[error("event name {0} is reserved")]
    ReservedEvent(String),
}

impl ProtocolError {
    pub fn invalid_payload(event: &str, err: impl std::fmt::Display) -> Self {
        Self::InvalidPayload {
            event: event.to_string(),
            message: err.to_string(),
        }
    }
}
