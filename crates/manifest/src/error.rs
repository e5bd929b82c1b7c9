use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse manifest {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("unknown profile '{name}' (valid profiles: {})", valid.join(", "))]
    UnknownProfile { name: String, valid: Vec<String> },

    #[error("hook '{hook}' must be a single command string")]
    HookShape { hook: String },

    #[error("required variable '{name}' has no value")]
    MissingVar { name: String },

    #[error("invalid port spec '{spec}'")]
    PortSpec { spec: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    /// Stable error code surfaced to the CLI and HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "manifest_parse",
            Self::UnknownProfile { .. } => "profile_unknown",
            Self::HookShape { .. } => "hook_shape",
            Self::MissingVar { .. } => "secret_missing",
            Self::PortSpec { .. } => "manifest_parse",
            Self::Message { .. } => "internal",
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
