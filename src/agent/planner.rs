use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;

use super::classify::{self, RISKY_VERBS};
use super::models::{
    AgentCommand, Artifact, ArtifactKind, Cadence, Container, ContainerKind, Delivery,
    DeliveryMode, NewAutopilot, OutputFormat,
};
use crate::agent_config::{PlannerBackend, PlannerSection};

// ── Plans ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunPlan {
    pub title: String,
    pub steps: Vec<String>,
    pub summary: String,
    pub needs_approval: bool,
    #[serde(default)]
    pub approval_reason: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

/// Shape the proposer is asked to return. Every field except the reason is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProposedPlan {
    title: String,
    steps: Vec<String>,
    summary: String,
    needs_approval: bool,
    #[serde(default)]
    approval_reason: Option<String>,
}

impl RunPlan {
    /// Parse and validate a proposer reply, tolerating prose or code fences around the JSON.
    pub fn parse(raw: &str) -> Result<Self> {
        let proposed: ProposedPlan = serde_json::from_str(extract_json(raw))
            .context("Failed to parse plan proposer response as JSON")?;

        if proposed.title.trim().chars().count() < 3 {
            bail!("plan title is too short");
        }
        if !(2..=7).contains(&proposed.steps.len()) {
            bail!("plan must have 2-7 steps, got {}", proposed.steps.len());
        }
        if let Some(step) = proposed.steps.iter().find(|s| s.trim().chars().count() < 3) {
            bail!("plan step '{}' is too short", step);
        }
        if proposed.summary.trim().chars().count() < 3 {
            bail!("plan summary is too short");
        }

        Ok(Self {
            title: proposed.title.trim().to_string(),
            steps: proposed.steps,
            summary: proposed.summary,
            needs_approval: proposed.needs_approval,
            approval_reason: proposed.approval_reason.filter(|r| !r.trim().is_empty()),
            artifacts: default_artifacts(),
        })
    }

    /// Deterministic four-step plan derived only from the request.
    pub fn fallback(command: &AgentCommand) -> Self {
        let ask: String = command.text.trim().chars().take(70).collect();
        Self {
            title: classify::truncate_title(&command.text, 56),
            steps: vec![
                format!("Understand the ask: {}", ask),
                "Collect relevant context from current channel and selected scope".to_string(),
                "Draft output and verify key facts".to_string(),
                format!(
                    "Deliver {} response with concise highlights",
                    command.output_format.as_str()
                ),
            ],
            summary: format!(
                "Prepared a plan for \"{}\" in {}.",
                command.text.trim(),
                command.container.label()
            ),
            needs_approval: false,
            approval_reason: None,
            artifacts: default_artifacts(),
        }
    }
}

/// Artifacts every run advertises.
pub fn default_artifacts() -> Vec<Artifact> {
    vec![
        Artifact::new("a-doc", ArtifactKind::Doc, "Draft output"),
        Artifact::new("a-link", ArtifactKind::Link, "Source notes"),
        Artifact::new("a-canvas", ArtifactKind::Canvas, "Open Canvas"),
    ]
}

/// Shape a summary for the requested output format.
pub fn format_summary(summary: &str, format: OutputFormat) -> String {
    match format {
        OutputFormat::Checklist => summary
            .split('.')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| format!("- [ ] {}", line))
            .collect::<Vec<_>>()
            .join("\n"),
        OutputFormat::Doc => format!(
            "## Overview\n\n{}\n\n## Next Steps\n\n- [ ] Validate assumptions\n- [ ] Share with team",
            summary
        ),
        OutputFormat::Pr => format!(
            "## Summary\n{}\n\n## Proposed Changes\n- [ ] Update implementation\n- [ ] Add tests\n\n## Risks\n- [ ] Verify rollout",
            summary
        ),
        OutputFormat::Brief => summary.to_string(),
    }
}

/// Slice from the first `{` to the last `}` when both exist.
fn extract_json(raw: &str) -> &str {
    match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => raw,
    }
}

// ── Autopilot drafts ─────────────────────────────────────────────────

/// Text heuristics used when no proposer is available or its reply is unusable.
pub fn default_cadence_from_text(text: &str, tz: &str) -> Cadence {
    let lower = text.to_lowercase();
    let tz = tz.to_string();
    if lower.contains("every hour") || lower.contains("hourly") {
        Cadence::Hourly { minute: 0, tz }
    } else if lower.contains("weekday") {
        Cadence::Weekday {
            hour: 9,
            minute: 0,
            dow: vec![1, 2, 3, 4, 5],
            tz,
        }
    } else if lower.contains("weekly") {
        Cadence::Weekly {
            hour: 9,
            minute: 0,
            dow: vec![1],
            tz,
        }
    } else if lower.contains("every") && lower.contains("minute") {
        Cadence::Custom {
            every_minutes: 5,
            tz,
        }
    } else {
        Cadence::Daily {
            hour: 9,
            minute: 0,
            tz,
        }
    }
}

fn day_number(value: &Value) -> Option<u8> {
    if let Some(n) = value.as_f64() {
        return Some(n.trunc().clamp(0.0, 6.0) as u8);
    }
    let name = value.as_str()?.to_lowercase();
    let prefix: String = name.chars().take(3).collect();
    match prefix.as_str() {
        "sun" => Some(0),
        "mon" => Some(1),
        "tue" => Some(2),
        "wed" => Some(3),
        "thu" => Some(4),
        "fri" => Some(5),
        "sat" => Some(6),
        _ => None,
    }
}

/// Lenient cadence reading: clamps numbers, maps day names, fills defaults.
pub fn normalize_cadence(value: &Value, fallback_tz: &str) -> Cadence {
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("daily")
        .to_lowercase();
    let days: Vec<u8> = value
        .get("dow")
        .and_then(Value::as_array)
        .map(|days| days.iter().filter_map(day_number).collect())
        .unwrap_or_default();
    let hour = value
        .get("hour")
        .and_then(Value::as_f64)
        .map(|h| h.trunc().clamp(0.0, 23.0) as u8)
        .unwrap_or(9);
    let minute = value
        .get("minute")
        .and_then(Value::as_f64)
        .map(|m| m.trunc().clamp(0.0, 59.0) as u8)
        .unwrap_or(0);
    let tz = value
        .get("tz")
        .and_then(Value::as_str)
        .filter(|tz| !tz.trim().is_empty())
        .unwrap_or(fallback_tz)
        .to_string();

    match kind.as_str() {
        "weekday" | "weekdays" => Cadence::Weekday {
            hour,
            minute,
            dow: if days.is_empty() { vec![1, 2, 3, 4, 5] } else { days },
            tz,
        },
        "dow" if days.len() == 5 => Cadence::Weekday {
            hour,
            minute,
            dow: days,
            tz,
        },
        "weekly" => Cadence::Weekly {
            hour,
            minute,
            dow: if days.is_empty() { vec![1] } else { days },
            tz,
        },
        "hourly" => Cadence::Hourly { minute, tz },
        "custom" => Cadence::Custom {
            every_minutes: value
                .get("everyMinutes")
                .or_else(|| value.get("every_minutes"))
                .and_then(Value::as_f64)
                .map(|m| m.trunc().max(1.0) as u32)
                .unwrap_or(60),
            tz,
        },
        _ => Cadence::Daily { hour, minute, tz },
    }
}

pub fn normalize_delivery_mode(value: Option<&Value>) -> DeliveryMode {
    match value.and_then(Value::as_str).map(str::to_lowercase).as_deref() {
        Some("verbose") | Some("immediate") | Some("post") => DeliveryMode::Verbose,
        _ => DeliveryMode::Digest,
    }
}

fn fallback_autopilot(command: &AgentCommand, tz: &str) -> NewAutopilot {
    let short: String = command.text.trim().chars().take(32).collect();
    NewAutopilot {
        title: format!("Autopilot: {}", short),
        instruction: command.text.trim().to_string(),
        cadence: default_cadence_from_text(&command.text, tz),
        destination: command.container.clone(),
        scope: command.scope.clone(),
        tools: command.tools,
        output_format: command.output_format,
        delivery: Delivery {
            mode: if command.output_format == OutputFormat::Brief {
                DeliveryMode::Digest
            } else {
                DeliveryMode::Verbose
            },
        },
        history: Vec::new(),
        last_run_at: None,
    }
}

/// Read a proposer reply into a draft; `None` when title or instruction is missing.
pub fn parse_autopilot_draft(raw: &str, command: &AgentCommand, tz: &str) -> Option<NewAutopilot> {
    let value: Value = serde_json::from_str(extract_json(raw)).ok()?;
    let text_field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let title = text_field("title")?;
    let instruction = text_field("instruction")?;

    let suggestion = value.get("destinationSuggestion");
    let kind = match suggestion.and_then(|s| s.get("type")).and_then(Value::as_str) {
        Some("dm") => ContainerKind::Dm,
        Some(_) => ContainerKind::Channel,
        None => command.container.kind,
    };
    let id = suggestion
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| command.container.id.clone());

    Some(NewAutopilot {
        title,
        instruction,
        cadence: normalize_cadence(value.get("cadence").unwrap_or(&Value::Null), tz),
        destination: Container { kind, id },
        scope: command.scope.clone(),
        tools: command.tools,
        output_format: command.output_format,
        delivery: Delivery {
            mode: normalize_delivery_mode(value.get("deliveryMode")),
        },
        history: Vec::new(),
        last_run_at: None,
    })
}

// ── Completion backends ──────────────────────────────────────────────

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Shells out to a local model CLI in print mode.
pub struct CliBackend {
    command: String,
}

impl CliBackend {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl CompletionBackend for CliBackend {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let output = Command::new(&self.command)
            .args([
                "--print",
                "--output-format",
                "text",
                "-p",
                user,
                "--system",
                system,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {} for planning", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("planner command failed: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// OpenAI-compatible chat completions endpoint.
pub struct OpenAiBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, model: &str, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.4,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let response: ChatResponse = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("chat completion request failed")?
            .error_for_status()
            .context("chat completion returned an error status")?
            .json()
            .await
            .context("chat completion response was not valid JSON")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .context("chat completion returned no content")
    }
}

// ── Planner ──────────────────────────────────────────────────────────

const RUN_PLAN_SYSTEM_PROMPT: &str = r#"You plan runs for a workspace chat agent.

Turn the user's request into a short, realistic run plan and the final output the run will post.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "title": "Short run title",
  "steps": ["2 to 7 progressive execution steps"],
  "summary": "Final output in markdown, in the requested output_format style",
  "needsApproval": false,
  "approvalReason": "Why a human should sign off (optional)"
}

Rules:
- For action items, to-dos, tasks or next steps, write the summary as a "- [ ] item" task list with no heading.
- Do not start the summary with a heading that repeats the title. Use at most one heading.
- Set needsApproval to true when any step sends, deletes, deploys, pushes, merges or schedules something.
- Keep language concise and specific to the provided context.
"#;

const AUTOPILOT_SYSTEM_PROMPT: &str = r#"Parse this recurring agent instruction.

You MUST respond with valid JSON only with the keys:
title, instruction, cadence (kind, hour, minute, dow, tz, everyMinutes), destinationSuggestion (type, id), deliveryMode.
kind is one of daily, weekday, weekly, hourly, custom. deliveryMode is digest or verbose.
"#;

/// Turns requests into run plans and autopilot drafts. Never fails: any
/// backend, timeout or validation problem degrades to the deterministic fallback.
#[derive(Clone)]
pub struct Planner {
    backend: Option<Arc<dyn CompletionBackend>>,
    timeout: Duration,
    timezone: String,
}

impl Planner {
    /// Planner that always uses the fallbacks.
    pub fn offline() -> Self {
        Self {
            backend: None,
            timeout: Duration::from_secs(30),
            timezone: "UTC".to_string(),
        }
    }

    pub fn with_backend(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::offline()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    pub fn from_config(section: &PlannerSection) -> Self {
        let backend: Option<Arc<dyn CompletionBackend>> = match section.backend {
            PlannerBackend::None => None,
            PlannerBackend::Cli => Some(Arc::new(CliBackend::new(section.command.clone()))),
            PlannerBackend::Openai => match std::env::var(&section.api_key_env) {
                Ok(key) if !key.trim().is_empty() => Some(Arc::new(OpenAiBackend::new(
                    &section.base_url,
                    &section.model,
                    key,
                ))),
                _ => {
                    tracing::warn!(
                        env = %section.api_key_env,
                        "openai planner selected but no API key set, using fallback plans"
                    );
                    None
                }
            },
        };
        Self {
            backend,
            timeout: Duration::from_secs(section.timeout_secs),
            timezone: section.timezone.clone(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map_or("none", |b| b.name())
    }

    async fn ask(&self, system: &str, user: &str) -> Option<String> {
        let backend = self.backend.as_ref()?;
        match tokio::time::timeout(self.timeout, backend.complete(system, user)).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(e)) => {
                tracing::warn!(backend = backend.name(), error = %e, "plan proposer call failed, using fallback");
                None
            }
            Err(_) => {
                tracing::warn!(backend = backend.name(), timeout = ?self.timeout, "plan proposer timed out, using fallback");
                None
            }
        }
    }

    pub async fn propose_run_plan(&self, command: &AgentCommand) -> RunPlan {
        let user = serde_json::json!({
            "user_request": command.text,
            "output_format": command.output_format.as_str(),
            "container": command.container.id,
            "context": {
                "channel_name": command.container.id,
                "thread_text": command.context_messages.join("\n"),
            },
            "risky_verbs": RISKY_VERBS,
        })
        .to_string();

        let mut plan = match self.ask(RUN_PLAN_SYSTEM_PROMPT, &user).await {
            Some(reply) => match RunPlan::parse(&reply) {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::warn!(error = %e, "invalid plan proposal, using fallback");
                    tracing::debug!(
                        raw = %reply.chars().take(500).collect::<String>(),
                        "rejected plan proposal"
                    );
                    RunPlan::fallback(command)
                }
            },
            None => RunPlan::fallback(command),
        };
        plan.summary = format_summary(&plan.summary, command.output_format);
        plan
    }

    pub async fn propose_autopilot(&self, command: &AgentCommand) -> NewAutopilot {
        let user = serde_json::json!({
            "text": command.text,
            "container": command.container,
            "tz": self.timezone,
        })
        .to_string();

        self.ask(AUTOPILOT_SYSTEM_PROMPT, &user)
            .await
            .and_then(|reply| {
                let draft = parse_autopilot_draft(&reply, command, &self.timezone);
                if draft.is_none() {
                    tracing::warn!("unusable autopilot proposal, using fallback");
                }
                draft
            })
            .unwrap_or_else(|| fallback_autopilot(command, &self.timezone))
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("backend", &self.backend_name())
            .field("timeout", &self.timeout)
            .field("timezone", &self.timezone)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Backend that replays a canned reply (or error) for every call.
    pub(crate) struct ScriptedBackend {
        pub reply: Result<String, String>,
    }

    impl ScriptedBackend {
        pub(crate) fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
            })
        }

        pub(crate) fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(message.to_string()),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            self.reply.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    /// Backend that never answers.
    struct StalledBackend;

    #[async_trait]
    impl CompletionBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            std::future::pending().await
        }
    }

    fn command(text: &str) -> AgentCommand {
        AgentCommand::new(text, Container::channel("general"))
    }

    #[test]
    fn test_parse_plan_response() {
        let json = r#"{
            "title": "Release checklist",
            "steps": ["Collect merged PRs", "Draft notes", "Post to channel"],
            "summary": "- [ ] Tag release",
            "needsApproval": true,
            "approvalReason": "Posts publicly"
        }"#;
        let plan = RunPlan::parse(json).unwrap();
        assert_eq!(plan.title, "Release checklist");
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.needs_approval);
        assert_eq!(plan.approval_reason.as_deref(), Some("Posts publicly"));
        assert_eq!(plan.artifacts.len(), 3);
    }

    #[test]
    fn test_parse_plan_with_markdown_wrapping() {
        let raw = "Here you go:\n```json\n{\"title\":\"Recap\",\"steps\":[\"Read\",\"Write\"],\"summary\":\"All quiet\",\"needsApproval\":false}\n```";
        let plan = RunPlan::parse(raw).unwrap();
        assert_eq!(plan.title, "Recap");
        assert!(plan.approval_reason.is_none());
    }

    #[test]
    fn test_parse_plan_rejects_invalid_shapes() {
        let cases = [
            "not json",
            r#"{"title":"Ok title","steps":["Only one"],"summary":"Fine","needsApproval":false}"#,
            r#"{"title":"Ok title","steps":["a","b","c","d","e","f","g","h"],"summary":"Fine","needsApproval":false}"#,
            r#"{"title":"Ok","steps":["Read","Write"],"summary":"Fine","needsApproval":false}"#,
            r#"{"title":"Ok title","steps":["Read","Wr"],"summary":"Fine","needsApproval":false}"#,
            r#"{"title":"Ok title","steps":["Read","Write"],"summary":"..","needsApproval":false}"#,
            r#"{"title":"Ok title","steps":["Read","Write"],"summary":"Fine"}"#,
        ];
        for raw in cases {
            assert!(RunPlan::parse(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn test_fallback_plan_creation() {
        let cmd = command("Draft the launch announcement for Friday").with_format(OutputFormat::Doc);
        let plan = RunPlan::fallback(&cmd);
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(
            plan.steps[0],
            "Understand the ask: Draft the launch announcement for Friday"
        );
        assert_eq!(plan.steps[3], "Deliver doc response with concise highlights");
        assert_eq!(plan.title, "Draft the launch announcement for Friday");
        assert!(plan.summary.contains("#general"));
        assert!(!plan.needs_approval);
    }

    #[test]
    fn test_fallback_plan_truncates_long_text() {
        let text = "x".repeat(120);
        let plan = RunPlan::fallback(&command(&text));
        assert_eq!(plan.title.chars().count(), 56);
        assert_eq!(plan.steps[0], format!("Understand the ask: {}", "x".repeat(70)));
    }

    #[test]
    fn test_format_summary_variants() {
        assert_eq!(
            format_summary("Ship it. Tell the team.", OutputFormat::Checklist),
            "- [ ] Ship it\n- [ ] Tell the team"
        );
        assert!(format_summary("Body", OutputFormat::Doc).starts_with("## Overview\n\nBody"));
        assert!(format_summary("Body", OutputFormat::Pr).contains("## Risks"));
        assert_eq!(format_summary("Body", OutputFormat::Brief), "Body");
    }

    #[test]
    fn test_default_cadence_from_text() {
        assert_eq!(default_cadence_from_text("post hourly", "UTC").kind(), "hourly");
        assert_eq!(default_cadence_from_text("every weekday morning", "UTC").kind(), "weekday");
        assert_eq!(default_cadence_from_text("weekly digest", "UTC").kind(), "weekly");
        assert_eq!(
            default_cadence_from_text("every 15 minutes", "UTC"),
            Cadence::Custom {
                every_minutes: 5,
                tz: "UTC".into()
            }
        );
        assert_eq!(default_cadence_from_text("recap standup", "UTC").kind(), "daily");
    }

    #[test]
    fn test_normalize_cadence_is_lenient() {
        let weekly = normalize_cadence(
            &serde_json::json!({"kind": "Weekly", "hour": 30.7, "minute": -4, "dow": ["Monday", "fri", 9, "nope"]}),
            "UTC",
        );
        assert_eq!(
            weekly,
            Cadence::Weekly {
                hour: 23,
                minute: 0,
                dow: vec![1, 5, 6],
                tz: "UTC".into()
            }
        );

        let weekdays = normalize_cadence(&serde_json::json!({"kind": "weekdays", "tz": "Europe/Berlin"}), "UTC");
        assert_eq!(
            weekdays,
            Cadence::Weekday {
                hour: 9,
                minute: 0,
                dow: vec![1, 2, 3, 4, 5],
                tz: "Europe/Berlin".into()
            }
        );

        let custom = normalize_cadence(&serde_json::json!({"kind": "custom", "everyMinutes": 0}), "UTC");
        assert_eq!(
            custom,
            Cadence::Custom {
                every_minutes: 1,
                tz: "UTC".into()
            }
        );

        assert_eq!(normalize_cadence(&Value::Null, "UTC").kind(), "daily");
    }

    #[test]
    fn test_parse_autopilot_draft() {
        let cmd = command("Every Monday post a recap").with_format(OutputFormat::Checklist);
        let raw = r#"{"title":"Monday recap","instruction":"Post a recap of last week",
            "cadence":{"kind":"weekly","dow":["mon"],"hour":10},
            "destinationSuggestion":{"type":"dm","id":"maya"},"deliveryMode":"immediate"}"#;
        let draft = parse_autopilot_draft(raw, &cmd, "UTC").unwrap();
        assert_eq!(draft.title, "Monday recap");
        assert_eq!(draft.destination, Container::dm("maya"));
        assert_eq!(draft.delivery.mode, DeliveryMode::Verbose);
        assert_eq!(draft.output_format, OutputFormat::Checklist);
        assert_eq!(draft.cadence.kind(), "weekly");

        assert!(parse_autopilot_draft(r#"{"title":"x"}"#, &cmd, "UTC").is_none());
    }

    #[tokio::test]
    async fn test_offline_planner_uses_fallback() {
        let planner = Planner::offline();
        let plan = planner
            .propose_run_plan(&command("Plan the offsite").with_format(OutputFormat::Checklist))
            .await;
        assert_eq!(plan.steps.len(), 4);
        assert!(plan.summary.starts_with("- [ ] "));
    }

    #[tokio::test]
    async fn test_planner_falls_back_on_backend_error() {
        let planner = Planner::with_backend(ScriptedBackend::failing("boom"));
        let plan = planner.propose_run_plan(&command("Plan the offsite")).await;
        assert_eq!(plan, {
            let mut expected = RunPlan::fallback(&command("Plan the offsite"));
            expected.summary = format_summary(&expected.summary, OutputFormat::Brief);
            expected
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_planner_falls_back_after_timeout() {
        let planner =
            Planner::with_backend(Arc::new(StalledBackend)).with_timeout(Duration::from_secs(2));
        let started = tokio::time::Instant::now();
        let plan = planner.propose_run_plan(&command("Plan the offsite")).await;
        assert_eq!(plan.steps.len(), 4);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_planner_falls_back_when_needs_approval_missing() {
        let planner = Planner::with_backend(ScriptedBackend::ok(
            r#"{"title":"Deploy hotfix","steps":["Build","Ship it"],"summary":"Done"}"#,
        ));
        let plan = planner.propose_run_plan(&command("deploy the hotfix")).await;
        assert_eq!(plan.steps.len(), 4);
        assert!(!plan.needs_approval);
    }

    #[tokio::test]
    async fn test_planner_uses_valid_proposal() {
        let planner = Planner::with_backend(ScriptedBackend::ok(
            r#"{"title":"Launch notes","steps":["Collect changes","Write notes"],"summary":"Shipped search. Fixed login.","needsApproval":false}"#,
        ));
        let plan = planner
            .propose_run_plan(&command("Write launch notes").with_format(OutputFormat::Checklist))
            .await;
        assert_eq!(plan.title, "Launch notes");
        assert_eq!(plan.summary, "- [ ] Shipped search\n- [ ] Fixed login");
    }

    #[tokio::test]
    async fn test_propose_autopilot_fallback() {
        let planner = Planner::offline().with_timezone("America/New_York");
        let draft = planner
            .propose_autopilot(&command("Every weekday summarize #general"))
            .await;
        assert_eq!(draft.title, "Autopilot: Every weekday summarize #general");
        assert_eq!(draft.cadence.kind(), "weekday");
        assert_eq!(draft.cadence.tz(), "America/New_York");
        assert_eq!(draft.delivery.mode, DeliveryMode::Digest);
    }
}
