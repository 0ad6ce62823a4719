use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::approval::ApprovalPolicies;
use super::engine::EngineTiming;
use super::planner::Planner;
use super::scheduler::SchedulerConfig;
use super::ws;
use crate::agent_config::{AgentToml, ServerSection};

/// Configuration for the agent server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
    /// Open the served URL in a browser once bound
    pub open_browser: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            dev_mode: false,
            open_browser: false,
        }
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            port: section.port,
            dev_mode: section.dev,
            open_browser: false,
        }
    }
}

/// Assemble shared state from resolved settings.
pub fn state_from_config(toml: &AgentToml) -> AppState {
    let planner = Planner::from_config(&toml.planner);
    let policies =
        ApprovalPolicies::from_switches(toml.approval.honor_planner, toml.approval.risk_heuristic);
    tracing::debug!(
        planner = planner.backend_name(),
        policies = ?policies.names(),
        "assembling agent state"
    );
    AppState::assemble(
        planner,
        policies,
        EngineTiming::from(&toml.timing),
        SchedulerConfig::from(&toml.scheduler),
        toml.server.event_buffer,
    )
}

/// Build the full application router with API and push channel.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Start the agent server and its autopilot scheduler.
pub async fn start_server(config: ServerConfig, state: SharedState) -> Result<()> {
    let scheduler = state.scheduler.clone().spawn();

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    let url = format!("http://{}", local_addr);
    tracing::info!(%url, dev = config.dev_mode, "agent server listening");
    println!("Workspace agent running at {}", url);

    if config.open_browser {
        // Give the listener a moment before the browser hits it.
        let target = url.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            if let Err(e) = open::that(&target) {
                tracing::warn!(error = %e, "failed to open browser");
            }
        });
    }

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    scheduler.abort();
    served?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
