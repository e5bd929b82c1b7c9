//! Runtime adapter: one trait, one CLI-driven implementation covering both
//! supported runtimes (docker and podman expose the same verb surface).

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    spec::ContainerSpec,
};

const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// Which container runtime backs the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn binary(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    /// `PLOINKY_RUNTIME` overrides; otherwise the first binary on PATH wins.
    pub fn detect() -> Result<Self> {
        if let Ok(forced) = std::env::var("PLOINKY_RUNTIME") {
            return match forced.as_str() {
                "docker" => Ok(Self::Docker),
                "podman" => Ok(Self::Podman),
                other => Err(Error::Message {
                    message: format!("unknown PLOINKY_RUNTIME '{other}' (docker|podman)"),
                }),
            };
        }
        if which::which("docker").is_ok() {
            return Ok(Self::Docker);
        }
        if which::which("podman").is_ok() {
            return Ok(Self::Podman);
        }
        Err(Error::NoRuntime)
    }
}

/// Observed container state from `inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Created,
    Other(String),
}

impl ContainerState {
    fn parse(status: &str) -> Self {
        match status.trim() {
            "running" => Self::Running,
            "exited" | "stopped" | "dead" => Self::Exited,
            "created" | "configured" => Self::Created,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A host ip/port pair reported by the runtime's port query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub host_ip: String,
    pub host_port: u16,
}

/// Capability surface shared by both runtimes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn rm(&self, name: &str) -> Result<()>;
    async fn exec(&self, name: &str, command: &str, opts: ExecOptions) -> Result<ExecOutput>;
    /// `None` when the container does not exist.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>>;
    async fn port(&self, name: &str, container_port: u16) -> Result<Vec<PublishedPort>>;
    async fn logs(&self, name: &str, tail: Option<usize>) -> Result<String>;
    /// Names of running containers.
    async fn ps(&self) -> Result<Vec<String>>;
}

/// CLI-backed implementation.
pub struct CliRuntime {
    kind: RuntimeKind,
}

impl CliRuntime {
    pub fn new(kind: RuntimeKind) -> Self {
        Self { kind }
    }

    pub fn detect() -> Result<Self> {
        Ok(Self::new(RuntimeKind::detect()?))
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<ExecOutput> {
        debug!(runtime = self.kind.binary(), args = ?args, "runtime call");
        let child = Command::new(self.kind.binary())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| Error::RuntimeUnavailable {
                detail: format!(
                    "{} {} timed out after {}s",
                    self.kind.binary(),
                    args.first().map(String::as_str).unwrap_or(""),
                    timeout.as_secs()
                ),
            })?
            .map_err(|e| Error::RuntimeUnavailable {
                detail: format!("failed to invoke {}: {e}", self.kind.binary()),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() && daemon_unreachable(&stderr) {
            return Err(Error::RuntimeUnavailable { detail: stderr });
        }
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    async fn run_ok(&self, args: &[String], make_err: impl Fn(String) -> Error) -> Result<String> {
        let out = self.run(args, RUNTIME_CALL_TIMEOUT).await?;
        if !out.success() {
            return Err(make_err(out.stderr.trim().to_string()));
        }
        Ok(out.stdout)
    }
}

fn daemon_unreachable(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("connection refused")
        || lower.contains("cannot connect to the docker daemon")
        || lower.contains("unable to connect to podman")
}

fn missing_container(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        let mut args = strings(&["create", "--name", name, "--restart", ContainerSpec::RESTART_POLICY]);
        if let Some(ref workdir) = spec.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }
        for bind in &spec.binds {
            let mut volume = format!("{}:{}", bind.source.display(), bind.target);
            if bind.ro {
                volume.push_str(":ro");
            }
            args.push("-v".into());
            args.push(volume);
        }
        for env in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", env.name, env.value));
        }
        for port in &spec.ports {
            args.push("-p".into());
            args.push(format!(
                "{}:{}:{}",
                port.host_ip, port.host_port, port.container_port
            ));
        }
        if let Some(ref entrypoint) = spec.entrypoint {
            args.push("--entrypoint".into());
            args.push(entrypoint.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let stdout = self
            .run_ok(&args, |detail| Error::Create {
                name: name.to_string(),
                detail,
            })
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run_ok(&strings(&["start", name]), |detail| {
            if missing_container(&detail) {
                Error::Missing {
                    name: name.to_string(),
                }
            } else {
                Error::Start {
                    name: name.to_string(),
                    detail,
                }
            }
        })
        .await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let out = self
            .run(&strings(&["stop", "-t", "5", name]), RUNTIME_CALL_TIMEOUT)
            .await?;
        if !out.success() && !missing_container(&out.stderr) {
            warn!(name, stderr = %out.stderr.trim(), "container stop failed");
        }
        Ok(())
    }

    async fn rm(&self, name: &str) -> Result<()> {
        let out = self
            .run(&strings(&["rm", "-f", name]), RUNTIME_CALL_TIMEOUT)
            .await?;
        if !out.success() && !missing_container(&out.stderr) {
            warn!(name, stderr = %out.stderr.trim(), "container rm failed");
        }
        Ok(())
    }

    async fn exec(&self, name: &str, command: &str, opts: ExecOptions) -> Result<ExecOutput> {
        let mut args = strings(&["exec"]);
        if let Some(ref workdir) = opts.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }
        for (key, value) in &opts.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.extend(strings(&[name, "sh", "-lc", command]));

        let out = self
            .run(&args, opts.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT))
            .await?;
        if !out.success() && missing_container(&out.stderr) {
            return Err(Error::Missing {
                name: name.to_string(),
            });
        }
        Ok(out)
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>> {
        let out = self
            .run(
                &strings(&["inspect", "--format", "{{.State.Status}}", name]),
                RUNTIME_CALL_TIMEOUT,
            )
            .await?;
        if !out.success() {
            if missing_container(&out.stderr) {
                return Ok(None);
            }
            return Err(Error::Exec {
                name: name.to_string(),
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(Some(ContainerState::parse(&out.stdout)))
    }

    async fn port(&self, name: &str, container_port: u16) -> Result<Vec<PublishedPort>> {
        let stdout = self
            .run_ok(
                &strings(&["port", name, &format!("{container_port}/tcp")]),
                |detail| {
                    if missing_container(&detail) {
                        Error::Missing {
                            name: name.to_string(),
                        }
                    } else {
                        Error::Exec {
                            name: name.to_string(),
                            detail,
                        }
                    }
                },
            )
            .await?;
        Ok(parse_port_output(&stdout))
    }

    async fn logs(&self, name: &str, tail: Option<usize>) -> Result<String> {
        let mut args = strings(&["logs"]);
        if let Some(n) = tail {
            args.push("--tail".into());
            args.push(n.to_string());
        }
        args.push(name.to_string());
        let out = self.run(&args, RUNTIME_CALL_TIMEOUT).await?;
        if !out.success() && missing_container(&out.stderr) {
            return Err(Error::Missing {
                name: name.to_string(),
            });
        }
        // Runtimes interleave app output across both streams.
        Ok(format!("{}{}", out.stdout, out.stderr))
    }

    async fn ps(&self) -> Result<Vec<String>> {
        let stdout = self
            .run_ok(&strings(&["ps", "--format", "{{.Names}}"]), |detail| {
                Error::RuntimeUnavailable { detail }
            })
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Parse `port` output lines like `127.0.0.1:32768` or `[::]:32768`.
fn parse_port_output(stdout: &str) -> Vec<PublishedPort> {
    let mut ports = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((ip, port)) = line.rsplit_once(':') else {
            continue;
        };
        let Ok(host_port) = port.parse::<u16>() else {
            continue;
        };
        let host_ip = ip.trim_start_matches('[').trim_end_matches(']');
        let host_ip = if host_ip.is_empty() { "::" } else { host_ip };
        ports.push(PublishedPort {
            host_ip: host_ip.to_string(),
            host_port,
        });
    }
    ports
}

/// True for bindings that would expose the port beyond loopback.
pub fn is_wildcard_ip(host_ip: &str) -> bool {
    matches!(host_ip, "0.0.0.0" | "::" | "*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_output_v4_and_v6() {
        let ports = parse_port_output("127.0.0.1:32768\n[::]:32768\n");
        assert_eq!(ports, vec![
            PublishedPort {
                host_ip: "127.0.0.1".into(),
                host_port: 32768,
            },
            PublishedPort {
                host_ip: "::".into(),
                host_port: 32768,
            },
        ]);
    }

    #[test]
    fn test_parse_port_output_bare_colons() {
        let ports = parse_port_output(":::9000\n");
        assert_eq!(ports[0].host_ip, "::");
        assert_eq!(ports[0].host_port, 9000);
    }

    #[test]
    fn test_wildcard_detection() {
        assert!(is_wildcard_ip("0.0.0.0"));
        assert!(is_wildcard_ip("::"));
        assert!(!is_wildcard_ip("127.0.0.1"));
        assert!(!is_wildcard_ip("::1"));
    }

    #[test]
    fn test_container_state_parse() {
        assert_eq!(ContainerState::parse("running\n"), ContainerState::Running);
        assert_eq!(ContainerState::parse("exited"), ContainerState::Exited);
        assert_eq!(
            ContainerState::parse("paused"),
            ContainerState::Other("paused".into())
        );
    }

    #[test]
    fn test_daemon_unreachable_detection() {
        assert!(daemon_unreachable(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"
        ));
        assert!(daemon_unreachable("dial tcp 127.0.0.1:2375: connection refused"));
        assert!(!daemon_unreachable("No such container: foo"));
    }
}
