use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User id every agent-authored message and typing signal is attributed to.
pub const AGENT_USER_ID: &str = "workspace-agent";

/// Creator recorded on runs started from the command surface.
pub const DEFAULT_CREATOR: &str = "you";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Runs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    NeedsApproval,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::NeedsApproval => "needs_approval",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed, failed and stopped runs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "needs_approval" => Ok(Self::NeedsApproval),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    #[default]
    Channel,
    Dm,
}

/// Channel or direct-message conversation a run or autopilot posts into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    #[serde(rename = "type", default)]
    pub kind: ContainerKind,
    pub id: String,
}

impl Container {
    pub fn channel(id: impl Into<String>) -> Self {
        Self {
            kind: ContainerKind::Channel,
            id: id.into(),
        }
    }

    pub fn dm(id: impl Into<String>) -> Self {
        Self {
            kind: ContainerKind::Dm,
            id: id.into(),
        }
    }

    /// `#general` for channels, the bare id for direct messages.
    pub fn label(&self) -> String {
        match self.kind {
            ContainerKind::Channel => format!("#{}", self.id),
            ContainerKind::Dm => self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ApprovalState {
    pub required: bool,
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Doc,
    Link,
    Pr,
    Canvas,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Artifact {
    pub fn new(id: &str, kind: ArtifactKind, title: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            title: title.to_string(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub created_by: String,
    pub container: Container,
    pub root_message_id: String,
    pub thread_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub current_step: u32,
    #[serde(default)]
    pub total_steps: u32,
    pub progress_pct: u8,
    pub latest_update: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub approval: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autopilot_id: Option<String>,
}

/// Summary row of the recency-sorted runs index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunIndexRow {
    pub id: String,
    pub title: String,
    pub status: RunStatus,
    pub progress_pct: u8,
    pub latest_update: String,
    pub created_at: i64,
}

impl From<&Run> for RunIndexRow {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            title: run.title.clone(),
            status: run.status,
            progress_pct: run.progress_pct,
            latest_update: run.latest_update.clone(),
            created_at: run.created_at,
        }
    }
}

/// Shallow merge applied to a stored run. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub title: Option<String>,
    pub status: Option<RunStatus>,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub progress_pct: Option<u8>,
    pub latest_update: Option<String>,
    pub artifacts: Option<Vec<Artifact>>,
    pub approval: Option<ApprovalState>,
}

impl RunPatch {
    pub fn apply(self, run: &mut Run) {
        if let Some(title) = self.title {
            run.title = title;
        }
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(step) = self.current_step {
            run.current_step = step;
        }
        if let Some(total) = self.total_steps {
            run.total_steps = total;
        }
        if let Some(pct) = self.progress_pct {
            run.progress_pct = pct;
        }
        if let Some(update) = self.latest_update {
            run.latest_update = update;
        }
        if let Some(artifacts) = self.artifacts {
            run.artifacts = artifacts;
        }
        if let Some(approval) = self.approval {
            run.approval = approval;
        }
    }
}

// ── Messages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Message,
    RunCard,
    Deliverable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactLink {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub ts: i64,
    pub is_bot: bool,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_root_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_links: Vec<ArtifactLink>,
}

impl Message {
    /// Agent-authored message with no thread or run attachment.
    pub fn from_agent(id: String, channel_id: &str, text: String) -> Self {
        Self {
            id,
            channel_id: channel_id.to_string(),
            user_id: AGENT_USER_ID.to_string(),
            text,
            ts: now_ms(),
            is_bot: true,
            kind: MessageKind::Message,
            parent_id: None,
            thread_root_id: None,
            run_id: None,
            title: None,
            artifact_links: Vec::new(),
        }
    }

    /// Root card anchoring a run's thread.
    pub fn run_card(run: &Run, text: String) -> Self {
        Self {
            kind: MessageKind::RunCard,
            run_id: Some(run.id.clone()),
            ..Self::from_agent(run.root_message_id.clone(), &run.container.id, text)
        }
    }

    pub fn belongs_to_run(&self, run_id: &str, root_message_id: &str) -> bool {
        self.id == root_message_id
            || self.parent_id.as_deref() == Some(root_message_id)
            || self.run_id.as_deref() == Some(run_id)
    }
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Brief,
    Checklist,
    Doc,
    Pr,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Checklist => "checklist",
            Self::Doc => "doc",
            Self::Pr => "pr",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brief" => Ok(Self::Brief),
            "checklist" => Ok(Self::Checklist),
            "doc" => Ok(Self::Doc),
            "pr" => Ok(Self::Pr),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

/// Which parts of the workspace a request may draw context from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScopeChips {
    #[serde(default)]
    pub channel: bool,
    #[serde(default)]
    pub thread: bool,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub people: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ToolToggles {
    #[serde(default)]
    pub drive: bool,
    #[serde(default)]
    pub calendar: bool,
    #[serde(default)]
    pub codebase: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadRef {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCommand {
    pub text: String,
    pub container: Container,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_thread: Option<ThreadRef>,
    #[serde(default)]
    pub context_messages: Vec<String>,
    #[serde(default)]
    pub scope: ScopeChips,
    #[serde(default)]
    pub tools: ToolToggles,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub require_approval: bool,
}

impl AgentCommand {
    pub fn new(text: impl Into<String>, container: Container) -> Self {
        Self {
            text: text.into(),
            container,
            in_thread: None,
            context_messages: Vec::new(),
            scope: ScopeChips::default(),
            tools: ToolToggles::default(),
            output_format: OutputFormat::Brief,
            require_approval: false,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("Command text must not be empty".to_string());
        }
        if self.container.id.trim().is_empty() {
            return Err("Container id must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Stop,
    Resume,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Resume => "resume",
        }
    }
}

// ── Autopilots ───────────────────────────────────────────────────────

fn default_hour() -> u8 {
    9
}

fn default_tz() -> String {
    "UTC".to_string()
}

fn default_every_minutes() -> u32 {
    60
}

fn default_weekdays() -> Vec<u8> {
    vec![1, 2, 3, 4, 5]
}

fn default_weekly_days() -> Vec<u8> {
    vec![1]
}

/// Recurrence of an autopilot. The timezone label is carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cadence {
    Hourly {
        #[serde(default)]
        minute: u8,
        #[serde(default = "default_tz")]
        tz: String,
    },
    Daily {
        #[serde(default = "default_hour")]
        hour: u8,
        #[serde(default)]
        minute: u8,
        #[serde(default = "default_tz")]
        tz: String,
    },
    Weekday {
        #[serde(default = "default_hour")]
        hour: u8,
        #[serde(default)]
        minute: u8,
        #[serde(default = "default_weekdays")]
        dow: Vec<u8>,
        #[serde(default = "default_tz")]
        tz: String,
    },
    Weekly {
        #[serde(default = "default_hour")]
        hour: u8,
        #[serde(default)]
        minute: u8,
        #[serde(default = "default_weekly_days")]
        dow: Vec<u8>,
        #[serde(default = "default_tz")]
        tz: String,
    },
    Custom {
        #[serde(default = "default_every_minutes")]
        every_minutes: u32,
        #[serde(default = "default_tz")]
        tz: String,
    },
}

impl Cadence {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hourly { .. } => "hourly",
            Self::Daily { .. } => "daily",
            Self::Weekday { .. } => "weekday",
            Self::Weekly { .. } => "weekly",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn tz(&self) -> &str {
        match self {
            Self::Hourly { tz, .. }
            | Self::Daily { tz, .. }
            | Self::Weekday { tz, .. }
            | Self::Weekly { tz, .. }
            | Self::Custom { tz, .. } => tz,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let (hour, minute, dow) = match self {
            Self::Hourly { minute, .. } => (0, *minute, None),
            Self::Daily { hour, minute, .. } => (*hour, *minute, None),
            Self::Weekday {
                hour, minute, dow, ..
            }
            | Self::Weekly {
                hour, minute, dow, ..
            } => (*hour, *minute, Some(dow)),
            Self::Custom { every_minutes, .. } => {
                if *every_minutes == 0 {
                    return Err("Custom cadence needs every_minutes >= 1".to_string());
                }
                (0, 0, None)
            }
        };
        if hour > 23 {
            return Err(format!("Cadence hour {} is out of range", hour));
        }
        if minute > 59 {
            return Err(format!("Cadence minute {} is out of range", minute));
        }
        if let Some(days) = dow
            && days.iter().any(|d| *d > 6)
        {
            return Err("Cadence days of week must be 0-6".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Digest,
    Verbose,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Delivery {
    #[serde(default)]
    pub mode: DeliveryMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutopilotFiring {
    pub run_id: String,
    pub at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Autopilot {
    pub id: String,
    pub title: String,
    pub instruction: String,
    pub cadence: Cadence,
    pub destination: Container,
    #[serde(default)]
    pub scope: ScopeChips,
    #[serde(default)]
    pub tools: ToolToggles,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub delivery: Delivery,
    pub enabled: bool,
    #[serde(default)]
    pub history: Vec<AutopilotFiring>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<i64>,
}

impl Autopilot {
    /// Command an autopilot firing submits. Scheduled runs never request approval themselves.
    pub fn to_command(&self) -> AgentCommand {
        AgentCommand {
            text: self.instruction.clone(),
            container: self.destination.clone(),
            in_thread: None,
            context_messages: Vec::new(),
            scope: self.scope.clone(),
            tools: self.tools,
            output_format: self.output_format,
            require_approval: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Autopilot title must not be empty".to_string());
        }
        if self.instruction.trim().is_empty() {
            return Err("Autopilot instruction must not be empty".to_string());
        }
        if self.destination.id.trim().is_empty() {
            return Err("Autopilot destination must not be empty".to_string());
        }
        if let Some(at) = self.last_run_at
            && at < 0
        {
            return Err(format!("Autopilot last_run_at must not be negative (got {})", at));
        }
        self.cadence.validate()
    }
}

/// Body of `POST /api/autopilots`. Identity and enablement are assigned server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAutopilot {
    pub title: String,
    pub instruction: String,
    pub cadence: Cadence,
    pub destination: Container,
    #[serde(default)]
    pub scope: ScopeChips,
    #[serde(default)]
    pub tools: ToolToggles,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub delivery: Delivery,
    #[serde(default)]
    pub history: Vec<AutopilotFiring>,
    #[serde(default)]
    pub last_run_at: Option<i64>,
}

impl NewAutopilot {
    pub fn into_autopilot(self, id: String) -> Autopilot {
        Autopilot {
            id,
            title: self.title,
            instruction: self.instruction,
            cadence: self.cadence,
            destination: self.destination,
            scope: self.scope,
            tools: self.tools,
            output_format: self.output_format,
            delivery: self.delivery,
            enabled: true,
            history: self.history,
            last_run_at: self.last_run_at,
        }
    }
}

/// Body of `PATCH /api/autopilots/{id}`; merged over the stored record and re-validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutopilotPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub cadence: Option<Cadence>,
    #[serde(default)]
    pub destination: Option<Container>,
    #[serde(default)]
    pub scope: Option<ScopeChips>,
    #[serde(default)]
    pub tools: Option<ToolToggles>,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
    #[serde(default)]
    pub delivery: Option<Delivery>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub last_run_at: Option<i64>,
}

impl AutopilotPatch {
    pub fn apply(self, autopilot: &mut Autopilot) {
        if let Some(title) = self.title {
            autopilot.title = title;
        }
        if let Some(instruction) = self.instruction {
            autopilot.instruction = instruction;
        }
        if let Some(cadence) = self.cadence {
            autopilot.cadence = cadence;
        }
        if let Some(destination) = self.destination {
            autopilot.destination = destination;
        }
        if let Some(scope) = self.scope {
            autopilot.scope = scope;
        }
        if let Some(tools) = self.tools {
            autopilot.tools = tools;
        }
        if let Some(format) = self.output_format {
            autopilot.output_format = format;
        }
        if let Some(delivery) = self.delivery {
            autopilot.delivery = delivery;
        }
        if let Some(enabled) = self.enabled {
            autopilot.enabled = enabled;
        }
        if let Some(at) = self.last_run_at {
            autopilot.last_run_at = Some(at);
        }
    }
}
