//! `client` — talk MCP to the router and to individual agents.

use anyhow::{Context, bail};

use {
    ploinky_mcp::{McpAgentClient, ToolContent},
    ploinky_workspace::RoutingTable,
};

use super::workspace;
use crate::ClientAction;

fn router_port() -> anyhow::Result<u16> {
    let paths = workspace()?;
    let routing = RoutingTable::load(&paths)?;
    if routing.port != 0 {
        return Ok(routing.port);
    }
    bail!("router is not configured; run start first")
}

pub async fn handle(action: ClientAction) -> anyhow::Result<()> {
    match action {
        ClientAction::List { what } => list(&what).await,
        ClientAction::Status { agent } => status(&agent).await,
        ClientAction::Tool { name, rest } => tool(&name, &rest).await,
    }
}

async fn list(what: &str) -> anyhow::Result<()> {
    let port = router_port()?;
    let mut client = McpAgentClient::connect("router", port)
        .await
        .context("cannot reach the router; is it running?")?;
    match what {
        "tools" => {
            let tools = client.list_tools().await?;
            if tools.is_empty() {
                println!("no tools available");
            }
            for tool in tools {
                println!(
                    "  {} — {}",
                    tool.name,
                    tool.description.as_deref().unwrap_or("")
                );
            }
        },
        "resources" => {
            let resources = client.list_resources().await?;
            if resources.is_empty() {
                println!("no resources available");
            }
            for resource in resources {
                println!(
                    "  {} — {}",
                    resource.uri,
                    resource.name.as_deref().unwrap_or("")
                );
            }
        },
        other => bail!("unknown listing '{other}' (tools|resources)"),
    }
    Ok(())
}

async fn status(agent: &str) -> anyhow::Result<()> {
    let paths = workspace()?;
    let routing = RoutingTable::load(&paths)?;
    let route = routing
        .routes
        .get(agent)
        .with_context(|| format!("agent '{agent}' has no route; is it started?"))?;
    let mut client = McpAgentClient::connect(agent, route.host_port)
        .await
        .with_context(|| format!("agent '{agent}' did not answer on port {}", route.host_port))?;
    client.ping().await?;
    let tools = client.list_tools().await?;
    println!(
        "agent '{agent}': reachable on 127.0.0.1:{}, {} tool(s)",
        route.host_port,
        tools.len()
    );
    Ok(())
}

/// Parse `[--agent <a>] [-p <json>] [-<key> <val> ...]` into a qualified
/// tool name and an arguments object.
fn parse_tool_args(
    name: &str,
    rest: &[String],
) -> anyhow::Result<(String, serde_json::Value)> {
    let mut agent: Option<String> = None;
    let mut params = serde_json::Map::new();
    let mut words = rest.iter();
    while let Some(word) = words.next() {
        match word.as_str() {
            "--agent" => {
                agent = Some(words.next().context("--agent requires a value")?.clone());
            },
            "-p" => {
                let raw = words.next().context("-p requires a JSON value")?;
                let value: serde_json::Value = serde_json::from_str(raw)
                    .with_context(|| format!("invalid JSON after -p: {raw}"))?;
                match value {
                    serde_json::Value::Object(map) => params.extend(map),
                    other => bail!("-p expects a JSON object, got {other}"),
                }
            },
            flag if flag.starts_with('-') => {
                let key = flag.trim_start_matches('-').to_string();
                if key.is_empty() {
                    bail!("empty parameter flag");
                }
                let value = words
                    .next()
                    .with_context(|| format!("-{key} requires a value"))?;
                // Numbers and booleans pass through typed; all else is text.
                let typed: serde_json::Value = serde_json::from_str(value)
                    .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
                params.insert(key, typed);
            },
            other => bail!("unexpected argument '{other}'"),
        }
    }
    let qualified = if name.contains(':') {
        name.to_string()
    } else {
        let agent = agent.context("unqualified tool name requires --agent <a>")?;
        format!("{agent}:{name}")
    };
    Ok((qualified, serde_json::Value::Object(params)))
}

async fn tool(name: &str, rest: &[String]) -> anyhow::Result<()> {
    let (qualified, arguments) = parse_tool_args(name, rest)?;
    let port = router_port()?;
    let mut client = McpAgentClient::connect("router", port)
        .await
        .context("cannot reach the router; is it running?")?;
    let result = client.call_tool(&qualified, arguments, None).await?;
    if result.is_error {
        eprintln!("tool reported an error");
    }
    for content in result.content {
        match content {
            ToolContent::Text { text } => println!("{text}"),
            ToolContent::Image { mime_type, data } => {
                println!("[image {mime_type}, {} bytes base64]", data.len());
            },
            ToolContent::Resource { resource } => println!("{resource}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| (*w).to_string()).collect()
    }

    #[test]
    fn test_parse_tool_args_qualified_passthrough() {
        let (name, args) = parse_tool_args("sim:run", &[]).unwrap();
        assert_eq!(name, "sim:run");
        assert_eq!(args, serde_json::json!({}));
    }

    #[test]
    fn test_parse_tool_args_agent_flag() {
        let (name, _) =
            parse_tool_args("run_simulation", &strs(&["--agent", "simulator"])).unwrap();
        assert_eq!(name, "simulator:run_simulation");
    }

    #[test]
    fn test_parse_tool_args_params_merge() {
        let (_, args) = parse_tool_args(
            "sim:run",
            &strs(&["-p", r#"{"iterations":10}"#, "-label", "fast", "-count", "3"]),
        )
        .unwrap();
        assert_eq!(args["iterations"], 10);
        assert_eq!(args["label"], "fast");
        assert_eq!(args["count"], 3);
    }

    #[test]
    fn test_parse_tool_args_requires_agent_for_bare_name() {
        assert!(parse_tool_args("run", &[]).is_err());
    }
}
