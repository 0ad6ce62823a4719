//! Authoritative in-memory store for runs, autopilots and the message log.
//!
//! Every mutation publishes through the injected [`EventSink`] while the
//! table lock is still held: a run change is always followed by the full
//! recency-sorted runs index, and no subscriber can observe one without the
//! other or see a half-applied change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use super::models::{
    AGENT_USER_ID, ArtifactLink, Autopilot, AutopilotFiring, AutopilotPatch, Container,
    Message, MessageKind, NewAutopilot, Run, RunIndexRow, RunPatch, RunStatus, now_ms,
};
use super::ws::{AgentEvent, EventSink};
use crate::errors::AgentError;

/// Input for [`RunRegistry::create_run`].
#[derive(Debug, Clone)]
pub struct NewRun {
    pub title: String,
    pub created_by: String,
    pub container: Container,
    pub autopilot_id: Option<String>,
}

/// Message emitted together with a run transition, attributed to the run's thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadPost {
    Text(String),
    Deliverable {
        title: String,
        body: String,
        links: Vec<ArtifactLink>,
    },
}

/// Result of a guarded transition closure: what to merge and what to post.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub patch: RunPatch,
    pub posts: Vec<ThreadPost>,
}

impl Transition {
    pub fn patch(patch: RunPatch) -> Self {
        Self {
            patch,
            posts: Vec::new(),
        }
    }

    pub fn post(mut self, post: ThreadPost) -> Self {
        self.posts.push(post);
        self
    }
}

struct StoredRun {
    seq: u64,
    run: Run,
}

struct StoredAutopilot {
    seq: u64,
    autopilot: Autopilot,
}

#[derive(Default)]
struct Tables {
    runs: HashMap<String, StoredRun>,
    autopilots: HashMap<String, StoredAutopilot>,
    messages: Vec<Message>,
    next_seq: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn sorted_runs(&self) -> Vec<&StoredRun> {
        let mut rows: Vec<&StoredRun> = self.runs.values().collect();
        rows.sort_by(|a, b| {
            b.run
                .created_at
                .cmp(&a.run.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        rows
    }

    fn runs_index(&self) -> Vec<RunIndexRow> {
        self.sorted_runs()
            .into_iter()
            .map(|s| RunIndexRow::from(&s.run))
            .collect()
    }
}

pub struct RunRegistry {
    tables: Mutex<Tables>,
    sink: Arc<dyn EventSink>,
}

impl RunRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // Every write is a single insert or assignment, so a poisoned table is still consistent.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_run(&self, tables: &Tables, run: &Run) {
        self.sink.publish(&AgentEvent::RunUpserted { run: run.clone() });
        self.sink.publish(&AgentEvent::RunsIndex {
            runs: tables.runs_index(),
        });
    }

    fn push_message(&self, tables: &mut Tables, message: Message) -> Message {
        tables.messages.push(message.clone());
        self.sink.publish(&AgentEvent::NewMessage {
            message: message.clone(),
        });
        message
    }

    // ── Runs ─────────────────────────────────────────────────────────

    pub fn create_run(&self, input: NewRun) -> Run {
        let root_message_id = Uuid::new_v4().to_string();
        let run = Run {
            id: Uuid::new_v4().to_string(),
            title: input.title,
            created_at: now_ms(),
            created_by: input.created_by,
            container: input.container,
            thread_id: root_message_id.clone(),
            root_message_id,
            status: RunStatus::Queued,
            current_step: 0,
            total_steps: 0,
            progress_pct: 0,
            latest_update: "Queued".to_string(),
            artifacts: Vec::new(),
            approval: Default::default(),
            autopilot_id: input.autopilot_id,
        };
        let mut tables = self.lock();
        let seq = tables.next_seq();
        tables.runs.insert(
            run.id.clone(),
            StoredRun {
                seq,
                run: run.clone(),
            },
        );
        self.publish_run(&tables, &run);
        run
    }

    pub fn get_run(&self, id: &str) -> Option<Run> {
        self.lock().runs.get(id).map(|s| s.run.clone())
    }

    /// All runs, newest first.
    pub fn list_runs(&self) -> Vec<Run> {
        self.lock()
            .sorted_runs()
            .into_iter()
            .map(|s| s.run.clone())
            .collect()
    }

    pub fn runs_index(&self) -> Vec<RunIndexRow> {
        self.lock().runs_index()
    }

    /// Unconditional shallow merge. `None` when the run does not exist.
    pub fn patch_run(&self, id: &str, patch: RunPatch) -> Option<Run> {
        let mut tables = self.lock();
        let stored = tables.runs.get_mut(id)?;
        patch.apply(&mut stored.run);
        let run = stored.run.clone();
        self.publish_run(&tables, &run);
        Some(run)
    }

    /// Read-check-write against the live record in one critical section.
    ///
    /// `decide` sees the current run and either rejects (nothing changes,
    /// nothing is published) or returns the patch plus thread posts to apply.
    pub fn transition<F>(&self, id: &str, decide: F) -> Result<Run, AgentError>
    where
        F: FnOnce(&Run) -> Result<Transition, AgentError>,
    {
        let mut tables = self.lock();
        let current = tables
            .runs
            .get(id)
            .map(|s| s.run.clone())
            .ok_or_else(|| AgentError::RunNotFound { id: id.to_string() })?;
        let Transition { patch, posts } = decide(&current)?;

        let mut run = current;
        patch.apply(&mut run);
        if let Some(stored) = tables.runs.get_mut(id) {
            stored.run = run.clone();
        }
        self.publish_run(&tables, &run);
        for post in posts {
            let message = build_post(&run, post);
            self.push_message(&mut tables, message);
        }
        Ok(run)
    }

    // ── Messages ─────────────────────────────────────────────────────

    pub fn create_run_card(&self, run: &Run) -> Message {
        let card = Message::run_card(run, run.title.clone());
        let mut tables = self.lock();
        self.push_message(&mut tables, card)
    }

    /// Messages in posting order, optionally limited to one container.
    pub fn messages(&self, channel_id: Option<&str>) -> Vec<Message> {
        self.lock()
            .messages
            .iter()
            .filter(|m| channel_id.is_none_or(|c| m.channel_id == c))
            .cloned()
            .collect()
    }

    /// "Agent is working" signal on the run's thread. Not a mutation.
    pub fn signal_working(&self, run: &Run) {
        self.sink.publish(&AgentEvent::Typing {
            user_id: AGENT_USER_ID.to_string(),
            channel_id: run.container.id.clone(),
            parent_id: Some(run.thread_id.clone()),
        });
    }

    // ── Autopilots ───────────────────────────────────────────────────

    pub fn create_autopilot(&self, input: NewAutopilot) -> Result<Autopilot, AgentError> {
        let autopilot = input.into_autopilot(Uuid::new_v4().to_string());
        autopilot.validate().map_err(AgentError::Validation)?;
        let mut tables = self.lock();
        let seq = tables.next_seq();
        tables.autopilots.insert(
            autopilot.id.clone(),
            StoredAutopilot {
                seq,
                autopilot: autopilot.clone(),
            },
        );
        self.sink.publish(&AgentEvent::AutopilotUpserted {
            autopilot: autopilot.clone(),
        });
        Ok(autopilot)
    }

    /// Merge `patch` over the stored autopilot; the merged record must still validate.
    pub fn patch_autopilot(&self, id: &str, patch: AutopilotPatch) -> Result<Autopilot, AgentError> {
        let mut tables = self.lock();
        let stored = tables
            .autopilots
            .get_mut(id)
            .ok_or_else(|| AgentError::AutopilotNotFound { id: id.to_string() })?;
        let mut next = stored.autopilot.clone();
        patch.apply(&mut next);
        next.validate().map_err(AgentError::Validation)?;
        stored.autopilot = next.clone();
        self.sink.publish(&AgentEvent::AutopilotUpserted {
            autopilot: next.clone(),
        });
        Ok(next)
    }

    pub fn get_autopilot(&self, id: &str) -> Option<Autopilot> {
        self.lock().autopilots.get(id).map(|s| s.autopilot.clone())
    }

    /// All autopilots in creation order.
    pub fn list_autopilots(&self) -> Vec<Autopilot> {
        let tables = self.lock();
        let mut rows: Vec<&StoredAutopilot> = tables.autopilots.values().collect();
        rows.sort_by_key(|s| s.seq);
        rows.into_iter().map(|s| s.autopilot.clone()).collect()
    }

    /// Stamp `last_run_at` and, when a run was started, append it to the history.
    pub fn record_firing(&self, id: &str, run_id: Option<&str>, at: i64) -> Option<Autopilot> {
        let mut tables = self.lock();
        let stored = tables.autopilots.get_mut(id)?;
        stored.autopilot.last_run_at = Some(at);
        if let Some(run_id) = run_id {
            stored.autopilot.history.push(AutopilotFiring {
                run_id: run_id.to_string(),
                at,
            });
        }
        let autopilot = stored.autopilot.clone();
        self.sink.publish(&AgentEvent::AutopilotUpserted {
            autopilot: autopilot.clone(),
        });
        Some(autopilot)
    }

    // ── Snapshot ─────────────────────────────────────────────────────

    pub fn snapshot(&self) -> AgentEvent {
        let tables = self.lock();
        let mut autopilots: Vec<&StoredAutopilot> = tables.autopilots.values().collect();
        autopilots.sort_by_key(|s| s.seq);
        AgentEvent::Snapshot {
            runs: tables
                .sorted_runs()
                .into_iter()
                .map(|s| s.run.clone())
                .collect(),
            autopilots: autopilots.into_iter().map(|s| s.autopilot.clone()).collect(),
            messages: tables.messages.clone(),
        }
    }
}

fn build_post(run: &Run, post: ThreadPost) -> Message {
    let base = Message::from_agent(Uuid::new_v4().to_string(), &run.container.id, String::new());
    match post {
        ThreadPost::Text(text) => Message {
            text,
            parent_id: Some(run.thread_id.clone()),
            run_id: Some(run.id.clone()),
            ..base
        },
        ThreadPost::Deliverable { title, body, links } => Message {
            text: body,
            kind: MessageKind::Deliverable,
            thread_root_id: Some(run.thread_id.clone()),
            run_id: Some(run.id.clone()),
            title: Some(title),
            artifact_links: links,
            ..base
        },
    }
}
