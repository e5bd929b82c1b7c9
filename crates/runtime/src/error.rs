#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no container runtime found (install docker or podman, or set PLOINKY_RUNTIME)")]
    NoRuntime,

    #[error("container runtime unreachable: {detail}")]
    RuntimeUnavailable { detail: String },

    #[error("failed to create container '{name}': {detail}")]
    Create { name: String, detail: String },

    #[error("failed to start container '{name}': {detail}")]
    Start { name: String, detail: String },

    #[error("exec in container '{name}' failed: {detail}")]
    Exec { name: String, detail: String },

    #[error("container '{name}' does not exist")]
    Missing { name: String },

    #[error("port {container_port} of '{name}' is bound to wildcard address {host_ip}")]
    PortWildcard {
        name: String,
        container_port: u16,
        host_ip: String,
    },

    #[error("dependency conflict on '{package}': core pins {core_version}, agent wants {agent_version}")]
    DepConflict {
        package: String,
        core_version: String,
        agent_version: String,
    },

    #[error("hook '{hook}' exited with status {exit_code}: {stderr}")]
    HookFailed {
        hook: String,
        exit_code: i32,
        stderr: String,
        in_container: bool,
    },

    #[error("probe script missing for '{name}'")]
    ProbeScriptMissing { name: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Manifest(#[from] ploinky_manifest::Error),

    #[error(transparent)]
    Workspace(#[from] ploinky_workspace::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    /// Stable error code surfaced to the CLI and HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRuntime => "container_missing",
            Self::RuntimeUnavailable { .. } => "transport_refused",
            Self::Create { .. } => "container_create",
            Self::Start { .. } => "container_start",
            Self::Exec { .. } => "container_exec",
            Self::Missing { .. } => "container_missing",
            Self::PortWildcard { .. } => "port_unexpected_wildcard",
            Self::DepConflict { .. } => "dep_conflict",
            Self::HookFailed { in_container, .. } => {
                if *in_container {
                    "container_exec"
                } else {
                    "internal"
                }
            },
            Self::ProbeScriptMissing { .. } => "probe_script_missing",
            Self::Manifest(e) => e.code(),
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
