mod commands;
mod supervisor;

use {
    clap::{Parser, Subcommand},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use commands::{agent, client, lifecycle, logs_cmd, profile, repo, vars, web};

#[derive(Parser)]
#[command(name = "ploinky", about = "Ploinky — containerised agent workspaces behind one router")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Enable a repo or an agent in this workspace.
    Enable {
        #[command(subcommand)]
        target: EnableTarget,
    },
    /// Disable a repo or an agent.
    Disable {
        #[command(subcommand)]
        target: DisableTarget,
    },
    /// List repos or agents.
    List {
        #[command(subcommand)]
        target: ListTarget,
    },
    /// Recreate an agent's container from a freshly computed spec.
    Refresh {
        #[command(subcommand)]
        target: RefreshTarget,
    },
    /// Materialise enabled agents and start the router.
    Start {
        /// Static agent served at the router root.
        static_agent: Option<String>,
        /// Router port (also `PORT`).
        port: Option<u16>,
    },
    /// Stop the router; containers keep running.
    Stop,
    /// Restart the router or one agent's container.
    Restart { target: Option<String> },
    /// Stop the router and remove containers and records.
    Shutdown,
    /// Shutdown, then wipe workspace state.
    Destroy,
    /// Remove stopped containers and stale records.
    Clean,
    /// Show workspace, container, and router status.
    Status,
    /// Open an interactive shell inside an agent's container.
    Shell { agent: String },
    /// Run an agent's CLI entry with arguments.
    Cli {
        agent: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the browser terminal URL (optionally choosing the shell).
    Webtty {
        shell: Option<String>,
        /// Rotate the component token first.
        #[arg(long)]
        rotate: bool,
    },
    /// Print the browser chat URL.
    Webchat {
        #[arg(long)]
        rotate: bool,
    },
    /// Print the meeting URL.
    Webmeet {
        moderator: Option<String>,
        #[arg(long)]
        rotate: bool,
    },
    /// Print the dashboard URL.
    Dashboard {
        #[arg(long)]
        rotate: bool,
    },
    /// Store a variable in the workspace secret store.
    Var { name: String, value: String },
    /// List stored variables.
    Vars,
    /// Print a variable through the resolution chain.
    Echo { name: String },
    /// Record an exported env mapping applied to agents at create time.
    Expose {
        exported: String,
        value: String,
        agent: Option<String>,
    },
    /// Show or switch the active profile (`list`, `validate`, `show`, or a name).
    Profile { action: Option<String> },
    /// Router log access.
    Logs {
        #[command(subcommand)]
        action: LogsAction,
    },
    /// Talk MCP to the router and agents.
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
    /// Run the router in the foreground (spawned by `start`).
    #[command(hide = true)]
    Router {
        #[arg(long, env = "PORT")]
        port: u16,
    },
}

#[derive(Subcommand)]
enum EnableTarget {
    /// `enable repo <name> [<url>]`
    Repo { name: String, url: Option<String> },
    /// `enable agent <name|repo/name> [global|devel [<repo>]] [as <alias>]`
    Agent {
        name: String,
        #[arg(trailing_var_arg = true)]
        rest: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DisableTarget {
    Repo { name: String },
    Agent { name: String },
}

#[derive(Subcommand)]
enum ListTarget {
    Repos,
    Agents,
}

#[derive(Subcommand)]
enum RefreshTarget {
    Agent { name: String },
}

#[derive(Subcommand)]
enum LogsAction {
    /// Follow the router log.
    Tail { target: Option<String> },
    /// Print the last n records.
    Last { n: usize },
}

#[derive(Subcommand)]
pub enum ClientAction {
    /// `client list tools|resources`
    List { what: String },
    /// MCP ping and tool count for one agent.
    Status { agent: String },
    /// Invoke a tool through the router.
    Tool {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        rest: Vec<String>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }
}

/// Port/permission failures exit 2, everything else 1.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let code = err
        .downcast_ref::<ploinky_gateway::Error>()
        .map(ploinky_gateway::Error::code)
        .or_else(|| {
            err.downcast_ref::<ploinky_workspace::Error>()
                .map(ploinky_workspace::Error::code)
        })
        .or_else(|| {
            err.downcast_ref::<ploinky_runtime::Error>()
                .map(ploinky_runtime::Error::code)
        });
    let permission = err
        .downcast_ref::<std::io::Error>()
        .map(|io| io.kind() == std::io::ErrorKind::PermissionDenied)
        .unwrap_or(false);
    match code {
        Some("router_listen" | "port_allocation" | "port_unexpected_wildcard") => 2,
        _ if permission => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let result = run(cli.command).await;
    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Enable { target } => match target {
            EnableTarget::Repo { name, url } => repo::enable(&name, url),
            EnableTarget::Agent { name, rest } => agent::enable(&name, &rest),
        },
        Commands::Disable { target } => match target {
            DisableTarget::Repo { name } => repo::disable(&name),
            DisableTarget::Agent { name } => agent::disable(&name).await,
        },
        Commands::List { target } => match target {
            ListTarget::Repos => repo::list(),
            ListTarget::Agents => agent::list(),
        },
        Commands::Refresh { target } => match target {
            RefreshTarget::Agent { name } => agent::refresh(&name).await,
        },
        Commands::Start { static_agent, port } => lifecycle::start(static_agent, port).await,
        Commands::Stop => lifecycle::stop(),
        Commands::Restart { target } => lifecycle::restart(target.as_deref()).await,
        Commands::Shutdown => lifecycle::shutdown(false).await,
        Commands::Destroy => lifecycle::shutdown(true).await,
        Commands::Clean => lifecycle::clean().await,
        Commands::Status => lifecycle::status().await,
        Commands::Shell { agent } => agent::shell(&agent),
        Commands::Cli { agent, args } => agent::run_cli(&agent, &args),
        Commands::Webtty { shell, rotate } => web::open("webtty", shell, rotate),
        Commands::Webchat { rotate } => web::open("webchat", None, rotate),
        Commands::Webmeet { moderator, rotate } => web::open_webmeet(moderator, rotate),
        Commands::Dashboard { rotate } => web::open("dashboard", None, rotate),
        Commands::Var { name, value } => vars::set(&name, &value),
        Commands::Vars => vars::list(),
        Commands::Echo { name } => vars::echo(&name),
        Commands::Expose {
            exported,
            value,
            agent,
        } => vars::expose(&exported, &value, agent.as_deref()),
        Commands::Profile { action } => profile::handle(action.as_deref()),
        Commands::Logs { action } => match action {
            LogsAction::Tail { target } => logs_cmd::tail(target.as_deref()),
            LogsAction::Last { n } => logs_cmd::last(n),
        },
        Commands::Client { action } => client::handle(action).await,
        Commands::Router { port } => lifecycle::run_router(port).await,
    }
}
