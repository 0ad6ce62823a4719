use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use workspace_agent::agent::models::OutputFormat;
use workspace_agent::agent_config::{AgentConfig, CliOverrides};
use workspace_agent::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "workspace-agent")]
#[command(version, about = "Approval-gated agent runs and autopilots for a team workspace")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to agent.toml. Defaults to .agent/agent.toml under the project directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent server with its autopilot scheduler
    Serve {
        /// Port to listen on (overrides agent.toml and AGENT_PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind on all interfaces with permissive CORS
        #[arg(long)]
        dev: bool,
        /// Demo time: autopilot intervals shrink to seconds and the scheduler ticks every 5 s
        #[arg(long)]
        accelerated: bool,
        /// Open the server URL in a browser
        #[arg(long)]
        open: bool,
    },
    /// Send a command to a running agent server
    Submit {
        /// What the agent should do
        text: String,
        /// Server base URL (defaults to the configured local port)
        #[arg(long)]
        server: Option<String>,
        #[arg(long, default_value = "general")]
        channel: String,
        /// Post into a direct message with this user instead of a channel
        #[arg(long)]
        dm: Option<String>,
        /// brief, checklist, doc or pr
        #[arg(long, default_value = "brief")]
        format: OutputFormat,
        /// Stop the run at the approval gate once its first step has run
        #[arg(long)]
        require_approval: bool,
        /// Reply inside this thread
        #[arg(long)]
        thread: Option<String>,
        /// Continue this run
        #[arg(long)]
        run: Option<String>,
        /// Follow progress until the run finishes or needs approval
        #[arg(short, long)]
        watch: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default agent.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = AgentConfig::load(project_dir, cli.config.clone())?;

    match cli.command {
        Commands::Serve {
            port,
            dev,
            accelerated,
            open,
        } => {
            let config = config.with_cli(CliOverrides {
                port,
                dev,
                accelerated,
            });
            cmd::cmd_serve(config, cli.verbose, open).await?;
        }
        Commands::Submit {
            text,
            server,
            channel,
            dm,
            format,
            require_approval,
            thread,
            run,
            watch,
        } => {
            let _guard = logging::init_tracing(&config.toml.logging, None, cli.verbose)?;
            let server =
                server.unwrap_or_else(|| format!("http://127.0.0.1:{}", config.toml.server.port));
            cmd::cmd_submit(cmd::SubmitArgs {
                text,
                server,
                channel,
                dm,
                format,
                require_approval,
                thread,
                run,
                watch,
            })
            .await?;
        }
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
