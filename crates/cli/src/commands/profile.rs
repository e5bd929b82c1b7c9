//! `profile [<name>|list|validate|show]`.

use ploinky_manifest::{Manifest, Profile};
use ploinky_workspace::repos::{self, EnabledRepos};

use super::workspace;

pub fn handle(action: Option<&str>) -> anyhow::Result<()> {
    let paths = workspace()?;
    match action {
        None => {
            println!("{}", repos::active_profile(&paths)?);
            Ok(())
        },
        Some("list") => {
            let active = repos::active_profile(&paths)?;
            for profile in Profile::ALL {
                let marker = if profile == active { "*" } else { " " };
                println!("{marker} {profile}");
            }
            Ok(())
        },
        Some("show") => {
            let active = repos::active_profile(&paths)?;
            println!("active profile: {active}");
            let registry = ploinky_workspace::AgentsRegistry::load(&paths)?;
            for record in registry.records.values() {
                println!("  {} runs profile {}", record.agent_name, record.profile);
            }
            Ok(())
        },
        Some("validate") => validate(),
        Some(name) => {
            let profile: Profile = name.parse()?;
            repos::set_active_profile(&paths, profile)?;
            println!("active profile set to {profile} (restart agents to apply)");
            Ok(())
        },
    }
}

/// Parse every enabled agent's manifest and resolve the active profile
/// against it, reporting all failures.
fn validate() -> anyhow::Result<()> {
    let paths = workspace()?;
    let active = repos::active_profile(&paths)?;
    let repos_list = EnabledRepos::load(&paths)?;
    let mut failures = 0usize;
    let mut checked = 0usize;
    for repo in &repos_list.repos {
        let repo_dir = paths.repo_dir(&repo.name);
        let Ok(entries) = std::fs::read_dir(&repo_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let manifest_path = entry.path().join("manifest.json");
            if !manifest_path.is_file() {
                continue;
            }
            checked += 1;
            let agent = entry.file_name().to_string_lossy().to_string();
            match Manifest::load(&manifest_path)
                .and_then(|m| ploinky_manifest::effective(&m, active))
            {
                Ok(_) => println!("  ok {}/{agent}", repo.name),
                Err(e) => {
                    failures += 1;
                    println!("  FAIL {}/{agent}: {e}", repo.name);
                },
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {checked} manifest(s) failed validation");
    }
    println!("{checked} manifest(s) valid for profile {active}");
    Ok(())
}
