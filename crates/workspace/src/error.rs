use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("secret '{name}' is not set (searched: {})", searched.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    SecretMissing { name: String, searched: Vec<PathBuf> },

    #[error("registry io failure on {path}: {detail}")]
    Registry { path: PathBuf, detail: String },

    #[error("failed to allocate a host port: {detail}")]
    PortAllocation { detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Manifest(#[from] ploinky_manifest::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    /// Stable error code surfaced to the CLI and HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SecretMissing { .. } => "secret_missing",
            Self::Registry { .. } => "registry_io",
            Self::PortAllocation { .. } => "port_allocation",
            Self::Manifest(e) => e.code(),
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
