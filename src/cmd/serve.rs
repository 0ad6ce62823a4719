//! Agent server command: `workspace-agent serve`.

use std::sync::Arc;

use anyhow::Result;
use workspace_agent::agent::server::{self, ServerConfig};
use workspace_agent::agent_config::AgentConfig;
use workspace_agent::logging;

pub async fn cmd_serve(config: AgentConfig, verbose: bool, open: bool) -> Result<()> {
    let _guard = logging::init_tracing(&config.toml.logging, config.log_dir(), verbose)?;

    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }

    let state = Arc::new(server::state_from_config(&config.toml));
    let mut server_config = ServerConfig::from(&config.toml.server);
    // No browser inside dev containers.
    server_config.open_browser = open && !server_config.dev_mode;

    tracing::info!(
        config = %config.config_path.display(),
        port = server_config.port,
        accelerated = config.toml.scheduler.accelerated,
        "starting workspace agent"
    );
    server::start_server(server_config, state).await
}
