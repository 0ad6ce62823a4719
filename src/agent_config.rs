//! Configuration for the workspace agent.
//!
//! Settings are read from `.agent/agent.toml` and layered file → environment → CLI.
//! Every section is optional; a missing file means all defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 4000
//! dev = false
//! event_buffer = 256
//!
//! [timing]
//! working_delay_ms = 700
//! step_delay_ms = 1100
//! resume_delay_ms = 500
//!
//! [scheduler]
//! tick_secs = 30
//! accelerated = false
//!
//! [planner]
//! backend = "cli"
//! command = "claude"
//! timezone = "Europe/Berlin"
//!
//! [approval]
//! honor_planner = true
//! risk_heuristic = true
//!
//! [logging]
//! filter = "info,workspace_agent=debug"
//! json = false
//! dir = ".agent/logs"
//! ```
//!
//! Environment overrides: `AGENT_PORT`, `DEMO_TIME_ACCEL=1`, `AGENT_PLANNER`,
//! `OPENAI_MODEL`, `CLAUDE_CMD`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory (relative to the project) that holds `agent.toml`.
pub const AGENT_DIR: &str = ".agent";
pub const CONFIG_FILE: &str = "agent.toml";

/// Which completion backend proposes run plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannerBackend {
    /// Always use the deterministic fallback plan.
    #[default]
    None,
    /// Shell out to a local model CLI.
    Cli,
    /// OpenAI-compatible chat completions endpoint.
    Openai,
}

impl std::fmt::Display for PlannerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerBackend::None => write!(f, "none"),
            PlannerBackend::Cli => write!(f, "cli"),
            PlannerBackend::Openai => write!(f, "openai"),
        }
    }
}

impl std::str::FromStr for PlannerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(PlannerBackend::None),
            "cli" | "claude" => Ok(PlannerBackend::Cli),
            "openai" => Ok(PlannerBackend::Openai),
            _ => anyhow::bail!(
                "Invalid planner backend '{}'. Valid values: none, cli, openai",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS and bind on all interfaces
    #[serde(default)]
    pub dev: bool,
    /// Capacity of the push broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_port() -> u16 {
    4000
}

fn default_event_buffer() -> usize {
    256
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            dev: false,
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingSection {
    #[serde(default = "default_working_delay_ms")]
    pub working_delay_ms: u64,
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    #[serde(default = "default_resume_delay_ms")]
    pub resume_delay_ms: u64,
}

fn default_working_delay_ms() -> u64 {
    700
}

fn default_step_delay_ms() -> u64 {
    1100
}

fn default_resume_delay_ms() -> u64 {
    500
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            working_delay_ms: default_working_delay_ms(),
            step_delay_ms: default_step_delay_ms(),
            resume_delay_ms: default_resume_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Demo mode: shrink cadence intervals to seconds
    #[serde(default)]
    pub accelerated: bool,
}

fn default_tick_secs() -> u64 {
    30
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            accelerated: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerSection {
    #[serde(default)]
    pub backend: PlannerBackend,
    /// Model CLI for the `cli` backend
    #[serde(default = "default_planner_command")]
    pub command: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key; the key itself never lives in the file
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Label applied to drafted autopilot cadences
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_planner_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_planner_command() -> String {
    "claude".to_string()
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_planner_timeout_secs() -> u64 {
    30
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            backend: PlannerBackend::default(),
            command: default_planner_command(),
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timezone: default_timezone(),
            timeout_secs: default_planner_timeout_secs(),
        }
    }
}

/// Which gate policies take part besides an explicit approval request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalSection {
    #[serde(default = "default_true")]
    pub honor_planner: bool,
    #[serde(default = "default_true")]
    pub risk_heuristic: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            honor_planner: true,
            risk_heuristic: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rolling log file here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            dir: None,
        }
    }
}

/// Root of `agent.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub approval: ApprovalSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AgentToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agent.toml")
    }

    /// Load `agent.toml` from `agent_dir`, or defaults when it does not exist.
    pub fn load_or_default(agent_dir: &Path) -> Result<Self> {
        let config_path = agent_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize agent.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides read through `lookup`. Unparseable values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("AGENT_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid AGENT_PORT"),
            }
        }
        if lookup("DEMO_TIME_ACCEL").as_deref() == Some("1") {
            self.scheduler.accelerated = true;
        }
        if let Some(backend) = lookup("AGENT_PLANNER") {
            match backend.parse() {
                Ok(backend) => self.planner.backend = backend,
                Err(e) => tracing::warn!(error = %e, "ignoring AGENT_PLANNER"),
            }
        }
        if let Some(model) = lookup("OPENAI_MODEL").filter(|m| !m.trim().is_empty()) {
            self.planner.model = model;
        }
        if let Some(cmd) = lookup("CLAUDE_CMD").filter(|c| !c.trim().is_empty()) {
            self.planner.command = cmd;
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port must be non-zero".to_string());
        }
        if self.server.event_buffer == 0 {
            warnings.push("server.event_buffer must be at least 1".to_string());
        }
        if self.scheduler.tick_secs == 0 {
            warnings.push("scheduler.tick_secs must be at least 1".to_string());
        }
        if self.timing.step_delay_ms == 0 {
            warnings.push(
                "timing.step_delay_ms is 0; runs will complete without visible progress"
                    .to_string(),
            );
        }
        if self.planner.timeout_secs == 0 {
            warnings.push("planner.timeout_secs must be at least 1".to_string());
        }
        if self.planner.backend == PlannerBackend::Openai
            && std::env::var(&self.planner.api_key_env).is_err()
        {
            warnings.push(format!(
                "planner.backend is openai but {} is not set; fallback plans will be used",
                self.planner.api_key_env
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.filter).is_err() {
            warnings.push(format!(
                "Invalid logging.filter '{}'",
                self.logging.filter
            ));
        }

        warnings
    }
}

/// Overrides supplied on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub dev: bool,
    pub accelerated: bool,
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub project_dir: PathBuf,
    /// File the settings came from (may not exist)
    pub config_path: PathBuf,
    pub toml: AgentToml,
}

impl AgentConfig {
    /// Read the file (explicit path or `.agent/agent.toml`) and apply the environment.
    pub fn load(project_dir: PathBuf, explicit: Option<PathBuf>) -> Result<Self> {
        let config_path = explicit.unwrap_or_else(|| project_dir.join(AGENT_DIR).join(CONFIG_FILE));
        let mut toml = if config_path.exists() {
            AgentToml::load(&config_path)?
        } else {
            AgentToml::default()
        };
        toml.apply_env();
        Ok(Self {
            project_dir,
            config_path,
            toml,
        })
    }

    pub fn with_cli(mut self, cli: CliOverrides) -> Self {
        if let Some(port) = cli.port {
            self.toml.server.port = port;
        }
        if cli.dev {
            self.toml.server.dev = true;
        }
        if cli.accelerated {
            self.toml.scheduler.accelerated = true;
        }
        self
    }

    pub fn agent_dir(&self) -> PathBuf {
        self.project_dir.join(AGENT_DIR)
    }

    /// Log directory, resolved against the project when relative.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.project_dir.join(dir)
            }
        })
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
