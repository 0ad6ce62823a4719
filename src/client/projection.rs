//! Client-side mirror of the run registry.
//!
//! A command shows up here as a **provisional** run the moment it is
//! submitted. The authoritative run later replaces it ([`ClientProjection::reconcile`])
//! or, when the call fails, it is thrown away with a single failure notice
//! ([`ClientProjection::fail_submission`]). Push frames are folded in through
//! [`ClientProjection::apply_event`], with out-of-order run records filtered by
//! [`super::stale::should_ignore`].

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use super::stale;
use crate::agent::classify::{self, RequestMode};
use crate::agent::lifecycle;
use crate::agent::models::{
    AgentCommand, ApprovalDecision, ApprovalState, Artifact, ArtifactKind,
    Autopilot, ControlAction, DEFAULT_CREATOR, Message, OutputFormat, Run, RunIndexRow, RunStatus,
    now_ms,
};
use crate::agent::ws::AgentEvent;
use crate::errors::ClientError;

/// Identities minted locally start with this prefix and never reach the server.
pub const PROVISIONAL_PREFIX: &str = "tmp-";

const TITLE_MAX_CHARS: usize = 64;
const FALLBACK_TITLE: &str = "Agent task";
const GATED_REASON: &str = "This action may post updates or change external documents.";
const CONTINUATION_REASON: &str = "Proposed action modifies external systems.";

static COMMAND_PREFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/(?:agent|autopilot)\b\s*").unwrap());

static MENTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)@workspaceagent|@workspace-agent|@agent").unwrap());

pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

fn provisional_id(kind: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}-{}", PROVISIONAL_PREFIX, kind, &suffix[..8])
}

/// Title shown on a provisional run: addressing stripped, capitalised, at most 64 chars.
pub fn provisional_title(text: &str) -> String {
    let stripped = COMMAND_PREFIX_REGEX.replace(text.trim(), "");
    let cleaned = MENTION_REGEX.replace_all(&stripped, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return FALLBACK_TITLE.to_string();
    }
    let short = classify::truncate_title(cleaned, TITLE_MAX_CHARS);
    let mut chars = short.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => short,
    }
}

fn step_update(current: u32, total: u32, format: OutputFormat) -> String {
    format!(
        "Step {}/{}: preparing {} output and artifacts.",
        current,
        total,
        format.as_str()
    )
}

fn provisional_artifacts() -> Vec<Artifact> {
    vec![
        Artifact::new(&provisional_id("artifact"), ArtifactKind::Doc, "Working notes"),
        Artifact::new(&provisional_id("artifact"), ArtifactKind::Pr, "Draft PR link"),
        Artifact::new(&provisional_id("artifact"), ArtifactKind::Canvas, "Plan canvas"),
    ]
}

fn thread_note(run: &Run, text: String) -> Message {
    Message {
        parent_id: Some(run.root_message_id.clone()),
        thread_root_id: Some(run.root_message_id.clone()),
        run_id: Some(run.id.clone()),
        ..Message::from_agent(provisional_id("msg"), &run.container.id, text)
    }
}

/// One optimistic submission in flight. Consumed by `reconcile` or `discard`.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisional {
    pub run_id: String,
    pub root_message_id: String,
    /// Thread notes synthesised for this submission.
    message_ids: Vec<String>,
    /// The record a continuation replaced, restored if the call fails.
    previous: Option<Run>,
}

impl Provisional {
    pub fn is_continuation(&self) -> bool {
        self.previous.is_some()
    }
}

#[derive(Debug, Default)]
pub struct ClientProjection {
    runs: HashMap<String, Run>,
    runs_index: Vec<RunIndexRow>,
    autopilots: HashMap<String, Autopilot>,
    messages: Vec<Message>,
    selected_run_id: Option<String>,
    active_thread_root_id: Option<String>,
}

impl ClientProjection {
    pub fn new() -> Self {
        Self::default()
    }

    // ── read side ────────────────────────────────────────────────────

    pub fn run(&self, id: &str) -> Option<&Run> {
        self.runs.get(id)
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn runs_index(&self) -> &[RunIndexRow] {
        &self.runs_index
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replies under `root_message_id`, oldest first.
    pub fn thread(&self, root_message_id: &str) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| m.parent_id.as_deref() == Some(root_message_id))
            .collect()
    }

    pub fn autopilots(&self) -> Vec<&Autopilot> {
        let mut all: Vec<&Autopilot> = self.autopilots.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn selected_run_id(&self) -> Option<&str> {
        self.selected_run_id.as_deref()
    }

    pub fn active_thread_root_id(&self) -> Option<&str> {
        self.active_thread_root_id.as_deref()
    }

    /// Select a run and open its thread. Returns false for an unknown run.
    pub fn open_run_thread(&mut self, run_id: &str) -> bool {
        let Some(run) = self.runs.get(run_id) else {
            return false;
        };
        self.active_thread_root_id = Some(run.root_message_id.clone());
        self.selected_run_id = Some(run.id.clone());
        true
    }

    pub fn close_thread(&mut self) {
        self.active_thread_root_id = None;
    }

    // ── authoritative updates ────────────────────────────────────────

    /// Install a server record unless it is an older view of what is shown.
    pub fn upsert_run(&mut self, run: Run) -> bool {
        if let Some(existing) = self.runs.get(&run.id)
            && stale::should_ignore(existing, &run)
        {
            tracing::debug!(
                run_id = %run.id,
                local = %existing.status,
                incoming = %run.status,
                "ignoring stale run update"
            );
            return false;
        }
        self.runs.insert(run.id.clone(), run);
        self.rebuild_index();
        true
    }

    /// Overwrite a record without the stale check; used to roll back a prediction.
    pub fn restore_run(&mut self, run: Run) {
        self.runs.insert(run.id.clone(), run);
        self.rebuild_index();
    }

    pub fn upsert_autopilot(&mut self, autopilot: Autopilot) {
        self.autopilots.insert(autopilot.id.clone(), autopilot);
    }

    /// Append a message unless one with the same id is already shown.
    pub fn add_message(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Take the server's index, keeping rows for provisional runs it cannot know about.
    pub fn apply_index(&mut self, rows: Vec<RunIndexRow>) {
        let mut rows = rows;
        rows.extend(
            self.runs
                .values()
                .filter(|r| is_provisional(&r.id))
                .map(RunIndexRow::from),
        );
        sort_rows(&mut rows);
        self.runs_index = rows;
    }

    /// Fold one push frame in. Returns whether anything visible changed.
    pub fn apply_event(&mut self, event: AgentEvent) -> bool {
        match event {
            AgentEvent::Snapshot {
                runs,
                autopilots,
                messages,
            } => {
                self.replace_from_snapshot(runs, autopilots, messages);
                true
            }
            AgentEvent::RunUpserted { run } => self.upsert_run(run),
            AgentEvent::AutopilotUpserted { autopilot } => {
                self.upsert_autopilot(autopilot);
                true
            }
            AgentEvent::RunsIndex { runs } => {
                self.apply_index(runs);
                true
            }
            AgentEvent::NewMessage { message } => self.add_message(message),
            AgentEvent::Typing { .. } => false,
        }
    }

    fn replace_from_snapshot(
        &mut self,
        runs: Vec<Run>,
        autopilots: Vec<Autopilot>,
        messages: Vec<Message>,
    ) {
        self.runs.retain(|id, _| is_provisional(id));
        for run in runs {
            self.runs.insert(run.id.clone(), run);
        }
        self.autopilots = autopilots
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        self.messages.retain(|m| {
            is_provisional(&m.id) || m.run_id.as_deref().is_some_and(is_provisional)
        });
        for message in messages {
            self.add_message(message);
        }
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        let mut rows: Vec<RunIndexRow> = self.runs.values().map(RunIndexRow::from).collect();
        sort_rows(&mut rows);
        self.runs_index = rows;
    }

    // ── optimistic submission ────────────────────────────────────────

    /// Show a command as a provisional run before the server has answered.
    ///
    /// A command addressed to a live run's thread updates that run in place
    /// instead of minting a new identity. A run held at the approval gate is
    /// left exactly as it is; see [`Self::check_continuation`].
    pub fn begin(&mut self, command: &AgentCommand) -> Provisional {
        if let Some(run_id) = command.in_thread.as_ref().and_then(|t| t.run_id.as_deref())
            && let Some(existing) = self.runs.get(run_id).filter(|r| !r.status.is_terminal())
        {
            let existing = existing.clone();
            if existing.status == RunStatus::NeedsApproval {
                return Provisional {
                    run_id: existing.id.clone(),
                    root_message_id: existing.root_message_id.clone(),
                    message_ids: Vec::new(),
                    previous: Some(existing),
                };
            }
            return self.begin_continuation(existing, command);
        }

        let concise =
            classify::request_mode(&command.text, command.output_format) == RequestMode::Concise;
        let gated = command.require_approval;
        let total: u32 = if gated {
            4
        } else if concise {
            2
        } else {
            3
        };
        let current: u32 = if gated { 2 } else { 1 };

        let root_message_id = provisional_id("msg-run");
        let run = Run {
            id: provisional_id("run"),
            title: provisional_title(&command.text),
            created_at: now_ms(),
            created_by: DEFAULT_CREATOR.to_string(),
            container: command.container.clone(),
            root_message_id: root_message_id.clone(),
            thread_id: root_message_id,
            status: if gated {
                RunStatus::NeedsApproval
            } else {
                RunStatus::Running
            },
            current_step: current,
            total_steps: total,
            progress_pct: lifecycle::progress_for(current as usize, total as usize),
            latest_update: if gated {
                "Waiting approval for a proposed action in thread.".to_string()
            } else if concise {
                "Preparing summary deliverable...".to_string()
            } else {
                step_update(current, total, command.output_format)
            },
            artifacts: provisional_artifacts(),
            approval: if gated {
                ApprovalState {
                    required: true,
                    pending: true,
                    reason: Some(GATED_REASON.to_string()),
                }
            } else {
                ApprovalState::default()
            },
            autopilot_id: None,
        };

        let mut notes = Vec::new();
        if !concise {
            notes.push(thread_note(
                &run,
                format!(
                    "Step 1/{}: gathering context from selected messages and files.",
                    total
                ),
            ));
        }
        if gated {
            notes.push(thread_note(
                &run,
                format!("Proposed action: {}", command.text.trim()),
            ));
        }

        let provisional = Provisional {
            run_id: run.id.clone(),
            root_message_id: run.root_message_id.clone(),
            message_ids: notes.iter().map(|m| m.id.clone()).collect(),
            previous: None,
        };

        self.messages
            .push(Message::run_card(&run, format!("Run started: {}", run.title)));
        self.messages.extend(notes);
        self.selected_run_id = Some(run.id.clone());
        self.runs.insert(run.id.clone(), run);
        self.rebuild_index();
        provisional
    }

    fn begin_continuation(&mut self, existing: Run, command: &AgentCommand) -> Provisional {
        let concise =
            classify::request_mode(&command.text, command.output_format) == RequestMode::Concise;
        let total = if existing.total_steps == 0 {
            3
        } else {
            existing.total_steps
        };
        let next = (existing.current_step + 1).min(total);
        let gated = existing.approval.required || command.require_approval;
        let status = if gated && next >= 2 {
            RunStatus::NeedsApproval
        } else {
            RunStatus::Running
        };

        let mut run = existing.clone();
        run.status = status;
        run.current_step = next;
        run.total_steps = total;
        run.progress_pct = existing
            .progress_pct
            .max(lifecycle::progress_for(next as usize, total as usize));
        run.latest_update = if status == RunStatus::NeedsApproval {
            "Waiting approval for proposed action in thread.".to_string()
        } else {
            step_update(next, total, command.output_format)
        };
        if gated {
            run.approval = ApprovalState {
                required: true,
                pending: status == RunStatus::NeedsApproval,
                reason: existing
                    .approval
                    .reason
                    .clone()
                    .or_else(|| Some(CONTINUATION_REASON.to_string())),
            };
        }

        let mut message_ids = Vec::new();
        if !concise || status == RunStatus::NeedsApproval {
            let text = if status == RunStatus::NeedsApproval {
                format!("Proposed action: {}", command.text.trim())
            } else {
                step_update(next, total, command.output_format)
            };
            let note = thread_note(&run, text);
            message_ids.push(note.id.clone());
            self.messages.push(note);
        }

        self.selected_run_id = Some(run.id.clone());
        let provisional = Provisional {
            run_id: run.id.clone(),
            root_message_id: run.root_message_id.clone(),
            message_ids,
            previous: Some(existing),
        };
        self.runs.insert(run.id.clone(), run);
        self.rebuild_index();
        provisional
    }

    /// Replace a provisional run with the server's record.
    ///
    /// Every message minted for the provisional identity goes away, pointers
    /// at it are moved to the authoritative identity, and a root card is
    /// added only if the push channel has not delivered one already.
    pub fn reconcile(&mut self, provisional: Provisional, authoritative: Run) -> Run {
        self.strip_provisional(&provisional);
        if !provisional.is_continuation() {
            self.runs.remove(&provisional.run_id);
        }
        let run_id = authoritative.id.clone();
        let root_message_id = authoritative.root_message_id.clone();
        let fallback = authoritative.clone();

        if !self.messages.iter().any(|m| m.id == root_message_id) {
            self.messages
                .push(Message::run_card(&authoritative, authoritative.title.clone()));
        }
        if !self.upsert_run(authoritative) {
            self.rebuild_index();
        }

        if self.selected_run_id.as_deref() == Some(provisional.run_id.as_str()) {
            self.selected_run_id = Some(run_id.clone());
        }
        if self.active_thread_root_id.as_deref() == Some(provisional.root_message_id.as_str()) {
            self.active_thread_root_id = Some(root_message_id);
        }
        tracing::debug!(provisional = %provisional.run_id, run_id = %run_id, "reconciled provisional run");

        self.runs.get(&run_id).cloned().unwrap_or(fallback)
    }

    /// Drop a provisional run and everything minted for it.
    pub fn discard(&mut self, provisional: Provisional) {
        self.strip_provisional(&provisional);
        match provisional.previous {
            Some(previous) => {
                self.runs.insert(previous.id.clone(), previous);
            }
            None => {
                self.runs.remove(&provisional.run_id);
                if self.selected_run_id.as_deref() == Some(provisional.run_id.as_str()) {
                    self.selected_run_id = None;
                }
                if self.active_thread_root_id.as_deref()
                    == Some(provisional.root_message_id.as_str())
                {
                    self.active_thread_root_id = None;
                }
            }
        }
        self.rebuild_index();
    }

    /// Discard the submission and post exactly one failure notice where it was sent.
    pub fn fail_submission(
        &mut self,
        provisional: Provisional,
        command: &AgentCommand,
        detail: &str,
    ) -> Message {
        self.discard(provisional);
        let parent = command.in_thread.as_ref().map(|t| t.thread_id.clone());
        let notice = Message {
            parent_id: parent.clone(),
            thread_root_id: parent,
            ..Message::from_agent(
                format!("msg-{}", Uuid::new_v4()),
                &command.container.id,
                format!("Agent call failed: {}.", detail),
            )
        };
        self.messages.push(notice.clone());
        notice
    }

    fn strip_provisional(&mut self, provisional: &Provisional) {
        let minted_identity = !provisional.is_continuation();
        self.messages.retain(|m| {
            if provisional.message_ids.contains(&m.id) {
                return false;
            }
            !(minted_identity && m.belongs_to_run(&provisional.run_id, &provisional.root_message_id))
        });
    }

    /// Reject a follow-up on a run awaiting approval: only approve or deny
    /// moves it past the gate.
    pub fn check_continuation(&self, command: &AgentCommand) -> Result<(), ClientError> {
        let Some(run_id) = command.in_thread.as_ref().and_then(|t| t.run_id.as_deref()) else {
            return Ok(());
        };
        match self.runs.get(run_id) {
            Some(run) if run.status == RunStatus::NeedsApproval => Err(ClientError::Rejected {
                id: run_id.to_string(),
                from: run.status,
                action: "continue",
            }),
            _ => Ok(()),
        }
    }

    // ── predicted controls ───────────────────────────────────────────

    /// Apply pause/stop/resume locally with the engine's transition table.
    pub fn predict_control(&mut self, run_id: &str, action: ControlAction) -> Result<Run, ClientError> {
        let current = self.known_run(run_id)?;
        let target = lifecycle::control_target(current.status, action).map_err(|r| {
            ClientError::Rejected {
                id: run_id.to_string(),
                from: r.from,
                action: r.action,
            }
        })?;
        let mut next = current;
        next.status = target;
        next.latest_update = lifecycle::control_update(action).to_string();
        if action == ControlAction::Stop {
            next.approval.pending = false;
        }
        self.restore_run(next.clone());
        Ok(next)
    }

    /// Apply approve/deny locally with the engine's transition table.
    pub fn predict_decision(
        &mut self,
        run_id: &str,
        decision: ApprovalDecision,
    ) -> Result<Run, ClientError> {
        let current = self.known_run(run_id)?;
        let target = lifecycle::decision_target(current.status, decision).map_err(|r| {
            ClientError::Rejected {
                id: run_id.to_string(),
                from: r.from,
                action: r.action,
            }
        })?;
        let mut next = current;
        next.status = target;
        next.latest_update = lifecycle::decision_update(decision).to_string();
        next.approval.pending = false;
        self.restore_run(next.clone());
        Ok(next)
    }

    fn known_run(&self, run_id: &str) -> Result<Run, ClientError> {
        self.runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownRun {
                id: run_id.to_string(),
            })
    }
}

fn sort_rows(rows: &mut [RunIndexRow]) {
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::models::{Container, MessageKind, ThreadRef};

    fn command(text: &str) -> AgentCommand {
        AgentCommand::new(text, Container::channel("general"))
    }

    fn server_run(id: &str, status: RunStatus, progress_pct: u8) -> Run {
        Run {
            id: id.into(),
            title: "Draft release notes".into(),
            created_at: 5_000,
            created_by: DEFAULT_CREATOR.into(),
            container: Container::channel("general"),
            root_message_id: format!("msg-{}", id),
            thread_id: format!("msg-{}", id),
            status,
            current_step: 0,
            total_steps: 4,
            progress_pct,
            latest_update: "Run started".into(),
            artifacts: vec![],
            approval: ApprovalState::default(),
            autopilot_id: None,
        }
    }

    fn root_cards(projection: &ClientProjection, run_id: &str) -> usize {
        projection
            .messages()
            .iter()
            .filter(|m| m.kind == MessageKind::RunCard && m.run_id.as_deref() == Some(run_id))
            .count()
    }

    fn mentions(projection: &ClientProjection, id: &str) -> bool {
        projection.runs_index().iter().any(|r| r.id == id)
            || projection.run(id).is_some()
            || projection.selected_run_id() == Some(id)
            || projection.messages().iter().any(|m| {
                m.id == id || m.run_id.as_deref() == Some(id) || m.parent_id.as_deref() == Some(id)
            })
    }

    #[test]
    fn test_provisional_title() {
        assert_eq!(provisional_title("/agent draft the notes"), "Draft the notes");
        assert_eq!(provisional_title("@agent   "), "Agent task");
        let long = format!("summarize {}", "x".repeat(100));
        let title = provisional_title(&long);
        assert_eq!(title.chars().count(), 64);
        assert!(title.starts_with("Summarize"));
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_begin_full_run() {
        let mut projection = ClientProjection::new();
        let p = projection.begin(&command("Draft release notes for v2"));

        assert!(is_provisional(&p.run_id));
        let run = projection.run(&p.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!((run.current_step, run.total_steps), (1, 3));
        assert_eq!(run.progress_pct, 33);
        assert_eq!(projection.selected_run_id(), Some(p.run_id.as_str()));
        assert_eq!(root_cards(&projection, &p.run_id), 1);
        assert_eq!(projection.thread(&p.root_message_id).len(), 1);
        assert_eq!(projection.runs_index()[0].id, p.run_id);
    }

    #[test]
    fn test_begin_concise_run_has_no_narration() {
        let mut projection = ClientProjection::new();
        let p = projection.begin(&command("Summarize this channel"));
        let run = projection.run(&p.run_id).unwrap();
        assert_eq!(run.total_steps, 2);
        assert_eq!(run.latest_update, "Preparing summary deliverable...");
        assert!(projection.thread(&p.root_message_id).is_empty());
    }

    #[test]
    fn test_begin_gated_run() {
        let mut projection = ClientProjection::new();
        let p = projection.begin(&command("Send the update").requiring_approval());
        let run = projection.run(&p.run_id).unwrap();
        assert_eq!(run.status, RunStatus::NeedsApproval);
        assert_eq!((run.current_step, run.total_steps), (2, 4));
        assert!(run.approval.pending);
        let thread = projection.thread(&p.root_message_id);
        assert!(thread.iter().any(|m| m.text == "Proposed action: Send the update"));
    }

    #[test]
    fn test_reconcile_replaces_every_reference() {
        let mut projection = ClientProjection::new();
        let p = projection.begin(&command("Draft release notes for v2"));
        projection.open_run_thread(&p.run_id);
        let provisional_id = p.run_id.clone();
        let provisional_root = p.root_message_id.clone();

        let shown = projection.reconcile(p, server_run("run-1", RunStatus::Running, 0));

        assert_eq!(shown.id, "run-1");
        assert!(!mentions(&projection, &provisional_id));
        assert!(!mentions(&projection, &provisional_root));
        assert_eq!(projection.selected_run_id(), Some("run-1"));
        assert_eq!(projection.active_thread_root_id(), Some("msg-run-1"));
        assert_eq!(root_cards(&projection, "run-1"), 1);
        assert_eq!(projection.runs_index().len(), 1);

        projection.close_thread();
        assert_eq!(projection.active_thread_root_id(), None);
        assert_eq!(projection.selected_run_id(), Some("run-1"));
    }

    #[test]
    fn test_reconcile_after_push_keeps_single_root_card() {
        let mut projection = ClientProjection::new();
        let p = projection.begin(&command("Draft release notes for v2"));

        // Push frames for the same run beat the direct response.
        let pushed = server_run("run-1", RunStatus::Running, 25);
        projection.apply_event(AgentEvent::RunUpserted { run: pushed.clone() });
        projection.apply_event(AgentEvent::NewMessage {
            message: Message::run_card(&pushed, "Draft release notes".into()),
        });

        let shown = projection.reconcile(p, server_run("run-1", RunStatus::Queued, 0));

        assert_eq!(root_cards(&projection, "run-1"), 1);
        assert_eq!(shown.status, RunStatus::Running);
        assert_eq!(shown.progress_pct, 25);
    }

    #[test]
    fn test_failed_submission_leaves_one_notice() {
        let mut projection = ClientProjection::new();
        let cmd = command("Draft release notes for v2");
        let p = projection.begin(&cmd);
        let provisional_id = p.run_id.clone();

        let notice = projection.fail_submission(p, &cmd, "connection refused");

        assert_eq!(notice.text, "Agent call failed: connection refused.");
        assert!(notice.is_bot);
        assert_eq!(projection.messages(), std::slice::from_ref(&notice));
        assert!(!mentions(&projection, &provisional_id));
        assert_eq!(projection.selected_run_id(), None);
        assert!(projection.runs_index().is_empty());
    }

    #[test]
    fn test_failed_thread_submission_posts_in_thread() {
        let mut projection = ClientProjection::new();
        let mut cmd = command("Draft release notes for v2");
        cmd.in_thread = Some(ThreadRef {
            thread_id: "msg-root".into(),
            run_id: None,
        });
        let p = projection.begin(&cmd);
        let notice = projection.fail_submission(p, &cmd, "timeout");
        assert_eq!(notice.parent_id.as_deref(), Some("msg-root"));
        assert_eq!(notice.channel_id, "general");
    }

    #[test]
    fn test_continuation_updates_in_place_and_reconciles() {
        let mut projection = ClientProjection::new();
        let mut existing = server_run("run-1", RunStatus::Running, 25);
        existing.current_step = 1;
        projection.upsert_run(existing);

        let mut cmd = command("Also include the API changes");
        cmd.in_thread = Some(ThreadRef {
            thread_id: "msg-run-1".into(),
            run_id: Some("run-1".into()),
        });
        let p = projection.begin(&cmd);

        assert!(p.is_continuation());
        assert_eq!(p.run_id, "run-1");
        assert_eq!(projection.run_count(), 1);
        let predicted = projection.run("run-1").unwrap();
        assert_eq!(predicted.current_step, 2);
        assert_eq!(predicted.progress_pct, 50);
        assert_eq!(projection.thread("msg-run-1").len(), 1);

        let shown = projection.reconcile(p, server_run("run-1", RunStatus::Running, 25));
        assert_eq!(shown.progress_pct, 25);
        assert!(projection.thread("msg-run-1").is_empty());
        assert_eq!(root_cards(&projection, "run-1"), 1);
    }

    #[test]
    fn test_failed_continuation_restores_previous_record() {
        let mut projection = ClientProjection::new();
        let existing = server_run("run-1", RunStatus::Running, 25);
        projection.upsert_run(existing.clone());

        let mut cmd = command("Also include the API changes");
        cmd.in_thread = Some(ThreadRef {
            thread_id: "msg-run-1".into(),
            run_id: Some("run-1".into()),
        });
        let p = projection.begin(&cmd);
        projection.fail_submission(p, &cmd, "server error");

        assert_eq!(projection.run("run-1"), Some(&existing));
        let thread = projection.thread("msg-run-1");
        assert_eq!(thread.len(), 1);
        assert!(thread[0].text.starts_with("Agent call failed"));
    }

    #[test]
    fn test_gated_run_is_not_predicted_past_the_gate() {
        let mut projection = ClientProjection::new();
        let mut held = server_run("run-1", RunStatus::NeedsApproval, 25);
        held.current_step = 1;
        held.approval = ApprovalState {
            required: true,
            pending: true,
            reason: Some("Risky action".into()),
        };
        projection.upsert_run(held.clone());

        let mut cmd = command("sounds good, carry on");
        cmd.in_thread = Some(ThreadRef {
            thread_id: "msg-run-1".into(),
            run_id: Some("run-1".into()),
        });
        assert!(matches!(
            projection.check_continuation(&cmd),
            Err(ClientError::Rejected {
                from: RunStatus::NeedsApproval,
                action: "continue",
                ..
            })
        ));

        let p = projection.begin(&cmd);
        assert!(p.is_continuation());
        assert_eq!(projection.run("run-1"), Some(&held));
        assert!(projection.thread("msg-run-1").is_empty());

        projection.discard(p);
        assert_eq!(projection.run("run-1"), Some(&held));
    }

    #[test]
    fn test_terminal_thread_target_starts_fresh_provisional() {
        let mut projection = ClientProjection::new();
        projection.upsert_run(server_run("run-1", RunStatus::Completed, 100));
        let mut cmd = command("Do it again");
        cmd.in_thread = Some(ThreadRef {
            thread_id: "msg-run-1".into(),
            run_id: Some("run-1".into()),
        });
        let p = projection.begin(&cmd);
        assert!(!p.is_continuation());
        assert_eq!(projection.run_count(), 2);
    }

    #[test]
    fn test_push_queued_after_running_is_ignored() {
        let mut projection = ClientProjection::new();
        projection.upsert_run(server_run("run-1", RunStatus::Running, 25));
        let changed = projection.apply_event(AgentEvent::RunUpserted {
            run: server_run("run-1", RunStatus::Queued, 0),
        });
        assert!(!changed);
        assert_eq!(projection.run("run-1").unwrap().status, RunStatus::Running);
    }

    #[test]
    fn test_index_frame_keeps_provisional_rows() {
        let mut projection = ClientProjection::new();
        let p = projection.begin(&command("Draft release notes for v2"));
        let other = server_run("run-9", RunStatus::Completed, 100);
        projection.apply_event(AgentEvent::RunsIndex {
            runs: vec![RunIndexRow::from(&other)],
        });
        let ids: Vec<&str> = projection.runs_index().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![p.run_id.as_str(), "run-9"]);
    }

    #[test]
    fn test_snapshot_replaces_server_state_but_keeps_provisional() {
        let mut projection = ClientProjection::new();
        projection.upsert_run(server_run("run-old", RunStatus::Running, 10));
        let p = projection.begin(&command("Draft release notes for v2"));

        let fresh = server_run("run-1", RunStatus::Running, 50);
        projection.apply_event(AgentEvent::Snapshot {
            runs: vec![fresh.clone()],
            autopilots: vec![],
            messages: vec![Message::run_card(&fresh, fresh.title.clone())],
        });

        assert!(projection.run("run-old").is_none());
        assert!(projection.run("run-1").is_some());
        assert!(projection.run(&p.run_id).is_some());
        assert_eq!(root_cards(&projection, &p.run_id), 1);
        assert_eq!(root_cards(&projection, "run-1"), 1);
    }

    #[test]
    fn test_duplicate_messages_are_ignored() {
        let mut projection = ClientProjection::new();
        let msg = Message::from_agent("m1".into(), "general", "hi".into());
        assert!(projection.add_message(msg.clone()));
        assert!(!projection.apply_event(AgentEvent::NewMessage { message: msg }));
        assert_eq!(projection.messages().len(), 1);
    }

    #[test]
    fn test_predict_control_uses_transition_table() {
        let mut projection = ClientProjection::new();
        projection.upsert_run(server_run("run-1", RunStatus::Running, 25));

        let paused = projection.predict_control("run-1", ControlAction::Pause).unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert_eq!(paused.latest_update, "Paused by user");

        let err = projection
            .predict_control("run-1", ControlAction::Pause)
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected { from: RunStatus::Paused, .. }));

        let stopped = projection.predict_control("run-1", ControlAction::Stop).unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert!(projection.predict_control("run-1", ControlAction::Resume).is_err());
    }

    #[test]
    fn test_predict_decision() {
        let mut projection = ClientProjection::new();
        let mut gated = server_run("run-1", RunStatus::NeedsApproval, 25);
        gated.approval = ApprovalState {
            required: true,
            pending: true,
            reason: Some("Risky".into()),
        };
        projection.upsert_run(gated);

        let denied = projection
            .predict_decision("run-1", ApprovalDecision::Deny)
            .unwrap();
        assert_eq!(denied.status, RunStatus::Failed);
        assert!(!denied.approval.pending);
        assert_eq!(denied.approval.reason.as_deref(), Some("Risky"));

        assert!(matches!(
            projection.predict_decision("ghost", ApprovalDecision::Approve),
            Err(ClientError::UnknownRun { .. })
        ));
    }

    #[test]
    fn test_progress_never_regresses_across_interleavings() {
        // Every ordering of the same three frames ends on the terminal one.
        let frames = [
            server_run("run-1", RunStatus::Queued, 0),
            server_run("run-1", RunStatus::Running, 25),
            server_run("run-1", RunStatus::Completed, 100),
        ];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let mut projection = ClientProjection::new();
            for i in order {
                projection.upsert_run(frames[i].clone());
            }
            let run = projection.run("run-1").unwrap();
            assert_eq!(run.status, RunStatus::Completed, "{order:?}");
            assert_eq!(run.progress_pct, 100, "{order:?}");
        }
    }
}
