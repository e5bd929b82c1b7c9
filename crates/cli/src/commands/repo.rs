//! `enable repo`, `disable repo`, `list repos`.

use ploinky_workspace::{layout, repos::EnabledRepos};

use super::workspace;

pub fn enable(name: &str, url: Option<String>) -> anyhow::Result<()> {
    let paths = workspace()?;
    layout::init_workspace(&paths)?;
    let mut repos = EnabledRepos::load(&paths)?;
    let entry = repos.enable(name, url)?.clone();
    repos.save(&paths)?;
    // Cloning is handled by the repository boundary; the repo contents are
    // expected under .ploinky/repos/<name>/.
    std::fs::create_dir_all(paths.repo_dir(name))?;
    match entry.url {
        Some(url) => println!("enabled repo '{name}' ({url})"),
        None => println!("enabled repo '{name}'"),
    }
    Ok(())
}

pub fn disable(name: &str) -> anyhow::Result<()> {
    let paths = workspace()?;
    let mut repos = EnabledRepos::load(&paths)?;
    if repos.disable(name) {
        repos.save(&paths)?;
        println!("disabled repo '{name}'");
    } else {
        println!("repo '{name}' was not enabled");
    }
    Ok(())
}

pub fn list() -> anyhow::Result<()> {
    let paths = workspace()?;
    let repos = EnabledRepos::load(&paths)?;
    if repos.repos.is_empty() {
        println!("no repos enabled");
        return Ok(());
    }
    for repo in &repos.repos {
        let present = paths.repo_dir(&repo.name).is_dir();
        println!(
            "  {} — {} [{}]",
            repo.name,
            repo.url.as_deref().unwrap_or("local"),
            if present { "present" } else { "missing" },
        );
    }
    Ok(())
}
