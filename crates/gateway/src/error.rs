#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to listen on {addr}: {detail}")]
    Listen { addr: String, detail: String },

    #[error("session not found or expired")]
    SessionExpired,

    #[error("agent unavailable: {agent}")]
    AgentUnavailable { agent: String },

    #[error("agent not found: {agent}")]
    AgentNotFound { agent: String },

    #[error("forbidden")]
    Forbidden,

    #[error("too many requests")]
    RateLimited,

    #[error("capacity exhausted: {detail}")]
    Capacity { detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Mcp(#[from] ploinky_mcp::Error),

    #[error(transparent)]
    Runtime(#[from] ploinky_runtime::Error),

    #[error(transparent)]
    Workspace(#[from] ploinky_workspace::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    /// Stable error code surfaced in `{error, detail}` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Listen { .. } => "router_listen",
            Self::SessionExpired => "session_expired",
            Self::AgentUnavailable { .. } | Self::AgentNotFound { .. } => "agent_unavailable",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::Capacity { .. } => "capacity",
            Self::Mcp(e) => e.code(),
            Self::Runtime(e) => e.code(),
            Self::Workspace(e) => e.code(),
            Self::Io(_) | Self::Message { .. } => "internal",
        }
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

ploinky_common::error_context!(Error);
