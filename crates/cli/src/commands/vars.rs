//! `var`, `vars`, `echo`, `expose`.

use anyhow::bail;

use ploinky_workspace::{AgentsRegistry, SecretStore};

use super::workspace;

pub fn set(name: &str, value: &str) -> anyhow::Result<()> {
    let paths = workspace()?;
    let store = SecretStore::new(paths);
    store.set_env_var(name, value)?;
    println!("stored {name}");
    Ok(())
}

pub fn list() -> anyhow::Result<()> {
    let paths = workspace()?;
    let store = SecretStore::new(paths);
    let vars = store.list();
    if vars.is_empty() {
        println!("no variables stored");
        return Ok(());
    }
    for (name, value) in vars {
        // Secrets are not echoed in full.
        let shown: String = value.chars().take(4).collect();
        println!("  {name}={shown}…");
    }
    Ok(())
}

pub fn echo(name: &str) -> anyhow::Result<()> {
    let paths = workspace()?;
    let store = SecretStore::new(paths);
    let name = name.strip_prefix('$').unwrap_or(name);
    let value = store.require_var(name)?;
    println!("{value}");
    Ok(())
}

/// Record `EXPORTED=<$VAR|value>` in the registry config, scoped to one
/// agent or to `*` for all agents. Applied at container create time.
pub fn expose(exported: &str, value: &str, agent: Option<&str>) -> anyhow::Result<()> {
    if exported.is_empty() {
        bail!("exported name must not be empty");
    }
    let paths = workspace()?;
    let store = SecretStore::new(paths.clone());
    if let Some(var) = value.strip_prefix('$') {
        // Fail fast when the referenced variable has no value anywhere.
        store.require_var(var)?;
    }
    let mut registry = AgentsRegistry::load(&paths)?;
    let scope = agent.unwrap_or("*").to_string();
    registry
        .config
        .expose
        .entry(scope.clone())
        .or_default()
        .insert(exported.to_string(), value.to_string());
    registry.save()?;
    match agent {
        Some(agent) => println!("exposed {exported} to agent '{agent}'"),
        None => println!("exposed {exported} to all agents"),
    }
    Ok(())
}
