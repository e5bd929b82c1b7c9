#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("'{method}' timed out after {elapsed_ms}ms")]
    TransportTimeout { method: String, elapsed_ms: u128 },

    #[error("connection refused for '{method}' after {elapsed_ms}ms")]
    TransportRefused { method: String, elapsed_ms: u128 },

    #[error("transport failure on '{method}' after {elapsed_ms}ms: {detail}")]
    Transport {
        method: String,
        elapsed_ms: u128,
        detail: String,
    },

    #[error("'{method}' failed: {message} (code {code})")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("batch requests are not supported")]
    UnsupportedBatch,

    #[error("invalid JSON-RPC response: {detail}")]
    InvalidResponse { detail: String },

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    /// Stable error code surfaced to the CLI and HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransportTimeout { .. } => "transport_timeout",
            Self::TransportRefused { .. } => "transport_refused",
            Self::Transport { .. } => "transport_error",
            Self::Rpc { .. } => "agent_unavailable",
            Self::UnsupportedBatch => "unsupported_batch",
            Self::InvalidResponse { .. } | Self::SerdeJson(_) => "invalid_jsonrpc",
            Self::Message { .. } => "internal",
        }
    }

    /// Transport-level failures close the session and mark the agent
    /// unavailable; protocol-level errors do not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TransportTimeout { .. } | Self::TransportRefused { .. } | Self::Transport { .. }
        )
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

ploinky_common::error_context!(Error);
