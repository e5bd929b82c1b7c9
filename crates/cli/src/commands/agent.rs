//! Agent enablement and direct container access.

use anyhow::{Context, bail};

use {
    ploinky_common::names,
    ploinky_manifest::Manifest,
    ploinky_runtime::CliRuntime,
    ploinky_workspace::{
        AgentRecord, AgentsRegistry, RecordStatus, RunMode, SecretStore, layout,
        repos::{self, EnabledRepos},
    },
};

use super::workspace;
use crate::commands::lifecycle::service_manager;

/// Parse the `[global|devel [<repo>]] [as <alias>]` tail of `enable agent`.
fn parse_enable_args(rest: &[String]) -> anyhow::Result<(RunMode, Option<String>, Option<String>)> {
    let mut mode = RunMode::Isolated;
    let mut devel_repo = None;
    let mut alias = None;
    let mut words = rest.iter().peekable();
    while let Some(word) = words.next() {
        match word.as_str() {
            "global" => mode = RunMode::Global,
            "devel" => {
                mode = RunMode::Devel;
                if let Some(next) = words.peek()
                    && next.as_str() != "as"
                {
                    devel_repo = words.next().cloned();
                }
            },
            "as" => {
                alias = Some(
                    words
                        .next()
                        .context("'as' requires an alias name")?
                        .clone(),
                );
            },
            other => bail!("unexpected argument '{other}' (expected global, devel, or as)"),
        }
    }
    Ok((mode, devel_repo, alias))
}

pub fn enable(spec: &str, rest: &[String]) -> anyhow::Result<()> {
    let paths = workspace()?;
    layout::init_workspace(&paths)?;
    let (run_mode, devel_repo, alias) = parse_enable_args(rest)?;

    let repos_list = EnabledRepos::load(&paths)?;
    let lookup = match &devel_repo {
        Some(repo) => format!("{repo}/{spec}"),
        None => spec.to_string(),
    };
    let (repo, agent, manifest_path) = repos::find_agent(&paths, &repos_list, &lookup)?;
    let manifest = Manifest::load(&manifest_path)?;
    let alias = alias.unwrap_or_else(|| agent.clone());

    layout::create_agent_symlinks(&paths, &alias, &repo, &agent)?;

    let profile = repos::active_profile(&paths)?;
    let mut registry = AgentsRegistry::load(&paths)?;
    let container_name = names::container_name(&repo, &alias, paths.root());
    if registry.get(&container_name).is_none() {
        registry.upsert(AgentRecord {
            container_name: container_name.clone(),
            agent_name: alias.clone(),
            source_agent: agent.clone(),
            repo_name: repo.clone(),
            image: manifest.image.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            project_path: paths.root().to_path_buf(),
            run_mode,
            profile: profile.to_string(),
            binds: Vec::new(),
            env: Vec::new(),
            ports: Vec::new(),
            status: RecordStatus::Created,
            spec_hash: String::new(),
        });
        registry.save()?;
    }
    println!("enabled agent '{alias}' from {repo}/{agent} ({})", manifest.image);
    Ok(())
}

pub async fn disable(name: &str) -> anyhow::Result<()> {
    let paths = workspace()?;
    let mut registry = AgentsRegistry::load(&paths)?;
    let Some(record) = registry.by_agent_name(name).cloned() else {
        bail!("agent '{name}' is not enabled");
    };
    if let Ok(runtime) = CliRuntime::detect() {
        use ploinky_runtime::ContainerRuntime;
        let _ = runtime.stop(&record.container_name).await;
        let _ = runtime.rm(&record.container_name).await;
    }
    registry.remove(&record.container_name);
    registry.save()?;
    layout::teardown_agent(&paths, name)?;
    println!("disabled agent '{name}'");
    Ok(())
}

pub fn list() -> anyhow::Result<()> {
    let paths = workspace()?;
    let registry = AgentsRegistry::load(&paths)?;
    if registry.records.is_empty() {
        println!("no agents enabled");
        return Ok(());
    }
    for record in registry.records.values() {
        let ports: Vec<String> = record
            .ports
            .iter()
            .map(|p| format!("{}→{}:{}", p.container_port, p.host_ip, p.host_port))
            .collect();
        println!(
            "  {} [{}/{}] {:?} profile={} ports=[{}]",
            record.agent_name,
            record.repo_name,
            record.image,
            record.status,
            record.profile,
            ports.join(", "),
        );
    }
    Ok(())
}

pub async fn refresh(name: &str) -> anyhow::Result<()> {
    let paths = workspace()?;
    let mut registry = AgentsRegistry::load(&paths)?;
    let Some(record) = registry.by_agent_name(name).cloned() else {
        bail!("agent '{name}' is not enabled");
    };
    let manager = service_manager(&paths)?;
    manager.remove_agent(&record.container_name).await?;

    let repos_list = EnabledRepos::load(&paths)?;
    let lookup = format!("{}/{}", record.repo_name, record.source_agent_dir());
    let (repo, agent, manifest_path) = repos::find_agent(&paths, &repos_list, &lookup)?;
    let manifest = Manifest::load(&manifest_path)?;
    let profile = repos::active_profile(&paths)?;
    let store = SecretStore::new(paths.clone());
    let identity = ploinky_runtime::service::AgentIdentity {
        alias: record.agent_name.clone(),
        repo,
        agent,
        run_mode: record.run_mode,
    };
    manager
        .provision(&mut registry, &store, &identity, &manifest, profile)
        .await?;
    println!("refreshed agent '{name}'");
    Ok(())
}

fn record_for(name: &str) -> anyhow::Result<AgentRecord> {
    let paths = workspace()?;
    let registry = AgentsRegistry::load(&paths)?;
    registry
        .by_agent_name(name)
        .cloned()
        .with_context(|| format!("agent '{name}' is not enabled"))
}

pub fn shell(name: &str) -> anyhow::Result<()> {
    let record = record_for(name)?;
    let runtime = CliRuntime::detect()?;
    let status = std::process::Command::new(runtime.kind().binary())
        .args(["exec", "-it", &record.container_name, "sh"])
        .status()
        .context("failed to exec into container")?;
    std::process::exit(status.code().unwrap_or(1));
}

pub fn run_cli(name: &str, args: &[String]) -> anyhow::Result<()> {
    let paths = workspace()?;
    let record = record_for(name)?;
    let repos_list = EnabledRepos::load(&paths)?;
    let lookup = format!("{}/{}", record.repo_name, record.source_agent_dir());
    let (_, _, manifest_path) = repos::find_agent(&paths, &repos_list, &lookup)?;
    let manifest = Manifest::load(&manifest_path)?;
    let cli = manifest
        .cli
        .with_context(|| format!("agent '{name}' declares no cli entry"))?;

    let mut command = cli;
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    let runtime = CliRuntime::detect()?;
    let status = std::process::Command::new(runtime.kind().binary())
        .args(["exec", "-it", &record.container_name, "sh", "-lc", &command])
        .status()
        .context("failed to exec into container")?;
    std::process::exit(status.code().unwrap_or(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enable_args_modes() {
        let (mode, repo, alias) = parse_enable_args(&[]).unwrap();
        assert_eq!(mode, RunMode::Isolated);
        assert!(repo.is_none() && alias.is_none());

        let (mode, ..) = parse_enable_args(&["global".into()]).unwrap();
        assert_eq!(mode, RunMode::Global);

        let (mode, repo, alias) = parse_enable_args(&[
            "devel".into(),
            "myrepo".into(),
            "as".into(),
            "sim".into(),
        ])
        .unwrap();
        assert_eq!(mode, RunMode::Devel);
        assert_eq!(repo.as_deref(), Some("myrepo"));
        assert_eq!(alias.as_deref(), Some("sim"));
    }

    #[test]
    fn test_parse_enable_args_devel_then_as() {
        let (mode, repo, alias) =
            parse_enable_args(&["devel".into(), "as".into(), "sim".into()]).unwrap();
        assert_eq!(mode, RunMode::Devel);
        assert!(repo.is_none());
        assert_eq!(alias.as_deref(), Some("sim"));
    }

    #[test]
    fn test_parse_enable_args_rejects_unknown() {
        assert!(parse_enable_args(&["bogus".into()]).is_err());
        assert!(parse_enable_args(&["as".into()]).is_err());
    }
}
