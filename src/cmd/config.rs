//! Configuration view and validation commands: `workspace-agent config`.

use anyhow::Result;
use workspace_agent::agent_config::{AgentConfig, AgentToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &AgentConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &config.config_path;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Workspace Agent Configuration");
            println!("=============================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No agent.toml found at {}", config_path.display());
                println!("Using defaults. Run 'workspace-agent config init' to create one.");
            }
            println!();

            // Effective values, environment and CLI overrides included
            let toml = &config.toml;
            println!("[server]");
            println!("  port = {}", toml.server.port);
            println!("  dev = {}", toml.server.dev);
            println!("  event_buffer = {}", toml.server.event_buffer);
            println!();
            println!("[timing]");
            println!("  working_delay_ms = {}", toml.timing.working_delay_ms);
            println!("  step_delay_ms = {}", toml.timing.step_delay_ms);
            println!("  resume_delay_ms = {}", toml.timing.resume_delay_ms);
            println!();
            println!("[scheduler]");
            println!("  tick_secs = {}", toml.scheduler.tick_secs);
            println!("  accelerated = {}", toml.scheduler.accelerated);
            println!();
            println!("[planner]");
            println!("  backend = \"{}\"", toml.planner.backend);
            println!("  command = \"{}\"", toml.planner.command);
            println!("  model = \"{}\"", toml.planner.model);
            println!("  timezone = \"{}\"", toml.planner.timezone);
            println!("  timeout_secs = {}", toml.planner.timeout_secs);
            println!();
            println!("[approval]");
            println!("  honor_planner = {}", toml.approval.honor_planner);
            println!("  risk_heuristic = {}", toml.approval.risk_heuristic);
            println!();
            println!("[logging]");
            println!("  filter = \"{}\"", toml.logging.filter);
            println!("  json = {}", toml.logging.json);
            if let Some(dir) = config.log_dir() {
                println!("  dir = \"{}\"", dir.display());
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No agent.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("agent.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            AgentToml::default().save(config_path)?;

            println!("Created agent.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] port, dev");
            println!("  - [planner] backend, command, model, timezone");
            println!("  - [approval] honor_planner, risk_heuristic");
            println!();
        }
    }

    Ok(())
}
