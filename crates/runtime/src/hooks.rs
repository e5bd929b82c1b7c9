//! Lifecycle hook execution.
//!
//! Host hooks run with the process environment plus the `PLOINKY_*`
//! injection set and the agent's resolved secrets. Container hooks run via
//! the runtime adapter. Every hook captures stdout/stderr and exit code;
//! non-zero exit is fatal to the agent's provisioning.

use std::{process::Stdio, time::Duration};

use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    adapter::{ContainerRuntime, ExecOptions},
    error::{Error, Result},
};

const HOST_HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// Environment injected into host hooks.
#[derive(Debug, Clone)]
pub struct HookEnv {
    pub profile: String,
    pub agent_name: String,
    pub repo_name: String,
    pub cwd: String,
    pub container_name: String,
    pub container_id: String,
    pub secrets: Vec<(String, String)>,
}

impl HookEnv {
    fn variables(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("PLOINKY_PROFILE".to_string(), self.profile.clone()),
            ("PLOINKY_AGENT_NAME".to_string(), self.agent_name.clone()),
            ("PLOINKY_REPO_NAME".to_string(), self.repo_name.clone()),
            ("PLOINKY_CWD".to_string(), self.cwd.clone()),
            (
                "PLOINKY_CONTAINER_NAME".to_string(),
                self.container_name.clone(),
            ),
            ("PLOINKY_CONTAINER_ID".to_string(), self.container_id.clone()),
        ];
        vars.extend(self.secrets.iter().cloned());
        vars
    }
}

/// Captured result of one hook run.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub hook: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run a host hook command through `sh -lc` in the workspace root.
pub async fn run_host_hook(hook: &str, command: &str, env: &HookEnv) -> Result<HookOutcome> {
    debug!(hook, command, "running host hook");
    let output = tokio::time::timeout(
        HOST_HOOK_TIMEOUT,
        Command::new("sh")
            .arg("-lc")
            .arg(command)
            .current_dir(&env.cwd)
            .envs(env.variables())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| Error::HookFailed {
        hook: hook.to_string(),
        exit_code: -1,
        stderr: format!("timed out after {}s", HOST_HOOK_TIMEOUT.as_secs()),
        in_container: false,
    })??;

    let outcome = HookOutcome {
        hook: hook.to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };
    finish(outcome, false)
}

/// Run a container hook command through the runtime adapter.
pub async fn run_container_hook(
    runtime: &dyn ContainerRuntime,
    container: &str,
    hook: &str,
    command: &str,
    workdir: Option<String>,
) -> Result<HookOutcome> {
    debug!(hook, container, command, "running container hook");
    let out = runtime
        .exec(container, command, ExecOptions {
            workdir,
            env: Vec::new(),
            timeout: Some(HOST_HOOK_TIMEOUT),
        })
        .await?;
    let outcome = HookOutcome {
        hook: hook.to_string(),
        exit_code: out.exit_code,
        stdout: out.stdout,
        stderr: out.stderr,
    };
    finish(outcome, true)
}

fn finish(outcome: HookOutcome, in_container: bool) -> Result<HookOutcome> {
    if outcome.exit_code != 0 {
        return Err(Error::HookFailed {
            hook: outcome.hook,
            exit_code: outcome.exit_code,
            stderr: outcome.stderr.trim().to_string(),
            in_container,
        });
    }
    info!(hook = %outcome.hook, "hook completed");
    Ok(outcome)
}
