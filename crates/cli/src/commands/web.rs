//! Browser component URLs (`webtty`, `webchat`, `webmeet`, `dashboard`)
//! and token rotation.

use anyhow::Context;

use ploinky_gateway::auth::token_env_for;
use ploinky_workspace::{AgentsRegistry, SecretStore};

use super::workspace;

pub fn open(app: &str, shell: Option<String>, rotate: bool) -> anyhow::Result<()> {
    let paths = workspace()?;
    let store = SecretStore::new(paths.clone());
    if let Some(shell) = shell {
        store.set_env_var("WEBTTY_SHELL", &shell)?;
    }

    let env = token_env_for(app).context("unknown component")?;
    let token = if rotate {
        store.rotate_token(env)?
    } else {
        store.component_token(env)?
    };

    let registry = AgentsRegistry::load(&paths)?;
    let port = registry
        .config
        .router_port
        .context("no router port configured; run start first")?;
    if rotate {
        println!("token rotated");
    }
    println!("http://127.0.0.1:{port}/{app}?token={token}");
    Ok(())
}

pub fn open_webmeet(moderator: Option<String>, rotate: bool) -> anyhow::Result<()> {
    let paths = workspace()?;
    if let Some(moderator) = moderator {
        let store = SecretStore::new(paths.clone());
        store.set_env_var("WEBMEET_MODERATOR", &moderator)?;
    }
    open("webmeet", None, rotate)
}
