//! Run lifecycle engine.
//!
//! Each active run has one progression chain: a spawned task that repeatedly
//! re-reads the live run and its execution state, decides the next action
//! with [`lifecycle::next_action`], and sleeps between steps. Pausing,
//! stopping, denying or reaching the approval gate needs no cancellation;
//! the chain observes the new status on its next read and exits.
//!
//! Every chain carries an epoch. Resuming (or approving) hands out a new
//! epoch and spawns a fresh chain, so a chain that was asleep when the run
//! was paused and resumed finds its epoch superseded and exits instead of
//! double-stepping.
//!
//! Lock order: registry tables, then executions. Execution state is only
//! mutated inside registry transitions, so a step and its bookkeeping commit
//! together. Nothing here calls into the registry while holding the
//! executions lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::approval::{ApprovalPolicies, GateContext};
use super::classify::{self, CONCISE_STEPS, RequestMode};
use super::deliverable;
use super::lifecycle::{self, NextAction, Rejected};
use super::models::{
    AgentCommand, ApprovalDecision, ApprovalState, ControlAction, DEFAULT_CREATOR, Run,
    RunPatch, RunStatus,
};
use super::planner::Planner;
use super::registry::{NewRun, RunRegistry, ThreadPost, Transition};
use crate::agent_config::TimingSection;
use crate::errors::AgentError;

const CONCISE_UPDATE: &str = "Preparing summary deliverable...";

/// Simulated latencies of the progression chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTiming {
    /// Between the "working" signal and the step it announces.
    pub working_delay: Duration,
    /// Between two progression ticks.
    pub step_delay: Duration,
    /// Between approve/resume and the first tick of the new chain.
    pub resume_delay: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            working_delay: Duration::from_millis(700),
            step_delay: Duration::from_millis(1100),
            resume_delay: Duration::from_millis(500),
        }
    }
}

impl From<&TimingSection> for EngineTiming {
    fn from(section: &TimingSection) -> Self {
        Self {
            working_delay: Duration::from_millis(section.working_delay_ms),
            step_delay: Duration::from_millis(section.step_delay_ms),
            resume_delay: Duration::from_millis(section.resume_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Set when an autopilot firing starts the run.
    pub autopilot_id: Option<String>,
    pub created_by: Option<String>,
}

/// Ephemeral per-run state; exists only while the run can still progress.
#[derive(Debug, Clone)]
struct Execution {
    epoch: u64,
    steps: Vec<String>,
    current_step: usize,
    summary: String,
    request_text: String,
    deliverable_title: String,
    require_approval: bool,
    planner_declared: bool,
    approval_reason: Option<String>,
    concise: bool,
    /// Set once a human approved; the gate never fires twice for one run.
    gate_cleared: bool,
}

enum Chain {
    Continue,
    Done,
}

struct EngineInner {
    registry: Arc<RunRegistry>,
    planner: Planner,
    policies: ApprovalPolicies,
    timing: EngineTiming,
    executions: Mutex<HashMap<String, Execution>>,
    epochs: AtomicU64,
}

#[derive(Clone)]
pub struct RunEngine {
    inner: Arc<EngineInner>,
}

fn rejected(run: &Run, r: Rejected) -> AgentError {
    AgentError::InvalidTransition {
        id: run.id.clone(),
        from: r.from,
        action: r.action,
    }
}

fn superseded(run: &Run, action: &'static str) -> AgentError {
    AgentError::InvalidTransition {
        id: run.id.clone(),
        from: run.status,
        action,
    }
}

impl RunEngine {
    pub fn new(
        registry: Arc<RunRegistry>,
        planner: Planner,
        policies: ApprovalPolicies,
        timing: EngineTiming,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                planner,
                policies,
                timing,
                executions: Mutex::new(HashMap::new()),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.inner.registry
    }

    pub fn planner(&self) -> &Planner {
        &self.inner.planner
    }

    /// Number of runs that still hold execution state.
    pub fn active_executions(&self) -> usize {
        self.executions().len()
    }

    fn executions(&self) -> MutexGuard<'_, HashMap<String, Execution>> {
        self.inner
            .executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn next_epoch(&self) -> u64 {
        self.inner.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ── start ────────────────────────────────────────────────────────

    /// Plan the request, create (or continue) its run and kick off the chain.
    ///
    /// A command whose `in_thread.run_id` names a live run reuses that run;
    /// a terminal one starts a fresh run instead. A run held at the approval
    /// gate cannot be continued: only approve or deny moves it on.
    pub async fn start(&self, command: AgentCommand, options: StartOptions) -> Result<Run, AgentError> {
        command.validate().map_err(AgentError::Validation)?;

        let continued = match command.in_thread.as_ref().and_then(|t| t.run_id.as_deref()) {
            Some(id) => {
                let run = self
                    .inner
                    .registry
                    .get_run(id)
                    .ok_or_else(|| AgentError::RunNotFound { id: id.to_string() })?;
                if run.status == RunStatus::NeedsApproval {
                    return Err(superseded(&run, "continue"));
                }
                (!run.status.is_terminal()).then_some(run)
            }
            None => None,
        };

        let plan = self.inner.planner.propose_run_plan(&command).await;
        let concise =
            classify::request_mode(&command.text, command.output_format) == RequestMode::Concise;
        let steps: Vec<String> = if concise {
            CONCISE_STEPS.iter().map(|s| s.to_string()).collect()
        } else {
            plan.steps.clone()
        };

        let is_continuation = continued.is_some();
        let run = match continued {
            Some(run) => run,
            None => {
                let title = classify::run_title(&command.text, &plan.title);
                let run = self.inner.registry.create_run(NewRun {
                    title,
                    created_by: options
                        .created_by
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CREATOR.to_string()),
                    container: command.container.clone(),
                    autopilot_id: options.autopilot_id.clone(),
                });
                self.inner.registry.create_run_card(&run);
                run
            }
        };

        let required = self
            .inner
            .policies
            .evaluate(&GateContext {
                request_text: &command.text,
                steps: &steps,
                require_approval: command.require_approval,
                planner_declared: plan.needs_approval,
            })
            .is_some();
        let epoch = self.next_epoch();
        let execution = Execution {
            epoch,
            steps: steps.clone(),
            current_step: 0,
            summary: plan.summary.clone(),
            request_text: command.text.clone(),
            deliverable_title: classify::deliverable_title(&command.text, &run.title, &run.container),
            require_approval: command.require_approval,
            planner_declared: plan.needs_approval,
            approval_reason: plan.approval_reason.clone(),
            concise,
            gate_cleared: false,
        };

        let run = self.inner.registry.transition(&run.id, |current| {
            if current.status.is_terminal() {
                return Err(superseded(current, "start"));
            }
            // The gate may have fired while the follow-up was being planned.
            if current.status == RunStatus::NeedsApproval {
                return Err(superseded(current, "continue"));
            }
            self.executions().insert(current.id.clone(), execution);
            let mut transition = Transition::patch(RunPatch {
                status: Some(RunStatus::Running),
                current_step: Some(0),
                total_steps: Some(steps.len() as u32),
                latest_update: Some(if concise { CONCISE_UPDATE } else { "Run started" }.to_string()),
                artifacts: Some(plan.artifacts.clone()),
                approval: Some(ApprovalState {
                    required,
                    pending: false,
                    reason: None,
                }),
                ..Default::default()
            });
            if !concise {
                transition = transition.post(ThreadPost::Text(format!("Starting run: {}", plan.title)));
            }
            Ok(transition)
        })?;

        tracing::info!(
            run_id = %run.id,
            steps = steps.len(),
            concise,
            approval_required = required,
            continued = is_continuation,
            "run started"
        );
        self.spawn_chain(run.id.clone(), epoch, Duration::ZERO);
        Ok(run)
    }

    // ── approve / deny ───────────────────────────────────────────────

    pub fn decide(&self, run_id: &str, decision: ApprovalDecision) -> Result<Run, AgentError> {
        let mut resume_epoch = None;
        let run = self.inner.registry.transition(run_id, |current| {
            let target = lifecycle::decision_target(current.status, decision)
                .map_err(|r| rejected(current, r))?;
            let approval = ApprovalState {
                pending: false,
                ..current.approval.clone()
            };
            let mut executions = self.executions();
            match decision {
                ApprovalDecision::Deny => {
                    executions.remove(run_id);
                    Ok(Transition::patch(RunPatch {
                        status: Some(target),
                        latest_update: Some(lifecycle::decision_update(decision).to_string()),
                        approval: Some(approval),
                        ..Default::default()
                    })
                    .post(ThreadPost::Text("Approval denied. Run stopped.".to_string())))
                }
                ApprovalDecision::Approve => {
                    if let Some(exec) = executions.get_mut(run_id) {
                        let epoch = self.next_epoch();
                        exec.epoch = epoch;
                        exec.gate_cleared = true;
                        resume_epoch = Some(epoch);
                    }
                    Ok(Transition::patch(RunPatch {
                        status: Some(target),
                        latest_update: Some(lifecycle::decision_update(decision).to_string()),
                        approval: Some(approval),
                        ..Default::default()
                    })
                    .post(ThreadPost::Text("Approval granted. Continuing run.".to_string())))
                }
            }
        })?;

        tracing::info!(run_id = %run.id, ?decision, status = %run.status, "approval decided");
        if let Some(epoch) = resume_epoch {
            self.spawn_chain(run.id.clone(), epoch, self.inner.timing.resume_delay);
        }
        Ok(run)
    }

    // ── pause / stop / resume ────────────────────────────────────────

    pub fn control(&self, run_id: &str, action: ControlAction) -> Result<Run, AgentError> {
        let mut resume_epoch = None;
        let run = self.inner.registry.transition(run_id, |current| {
            let target = lifecycle::control_target(current.status, action)
                .map_err(|r| rejected(current, r))?;
            let mut patch = RunPatch {
                status: Some(target),
                latest_update: Some(lifecycle::control_update(action).to_string()),
                ..Default::default()
            };
            let mut executions = self.executions();
            match action {
                ControlAction::Pause => {}
                ControlAction::Stop => {
                    executions.remove(run_id);
                    if current.approval.pending {
                        patch.approval = Some(ApprovalState {
                            pending: false,
                            ..current.approval.clone()
                        });
                    }
                }
                ControlAction::Resume => {
                    if let Some(exec) = executions.get_mut(run_id) {
                        let epoch = self.next_epoch();
                        exec.epoch = epoch;
                        resume_epoch = Some(epoch);
                    }
                }
            }
            Ok(Transition::patch(patch))
        })?;

        tracing::info!(run_id = %run.id, action = action.as_str(), status = %run.status, "run control applied");
        if let Some(epoch) = resume_epoch {
            self.spawn_chain(run.id.clone(), epoch, self.inner.timing.resume_delay);
        }
        Ok(run)
    }

    // ── progression chain ────────────────────────────────────────────

    fn spawn_chain(&self, run_id: String, epoch: u64, initial_delay: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            if !initial_delay.is_zero() {
                tokio::time::sleep(initial_delay).await;
            }
            while let Chain::Continue = engine.tick(&run_id, epoch).await {
                tokio::time::sleep(engine.inner.timing.step_delay).await;
            }
            tracing::debug!(run_id = %run_id, epoch, "progression chain ended");
        });
    }

    /// Decide from live state; `None` when the run or this chain's execution is gone.
    fn observe(&self, run_id: &str, epoch: u64) -> Option<NextAction> {
        let run = self.inner.registry.get_run(run_id)?;
        let executions = self.executions();
        let exec = executions.get(run_id).filter(|e| e.epoch == epoch)?;
        Some(lifecycle::next_action(
            run.status,
            exec.current_step,
            exec.steps.len(),
        ))
    }

    async fn tick(&self, run_id: &str, epoch: u64) -> Chain {
        match self.observe(run_id, epoch) {
            None | Some(NextAction::Halt) => Chain::Done,
            Some(NextAction::Deliver) => {
                if let Err(e) = self.deliver(run_id, epoch) {
                    tracing::debug!(run_id, error = %e, "delivery skipped");
                }
                Chain::Done
            }
            Some(NextAction::Advance) => {
                if let Some(run) = self.inner.registry.get_run(run_id) {
                    self.inner.registry.signal_working(&run);
                }
                tokio::time::sleep(self.inner.timing.working_delay).await;

                // A pause, stop or resume may have landed while working.
                if self.observe(run_id, epoch) != Some(NextAction::Advance) {
                    return Chain::Done;
                }
                match self.advance(run_id, epoch) {
                    Ok(true) => Chain::Done,
                    Ok(false) => Chain::Continue,
                    Err(e) => {
                        tracing::debug!(run_id, error = %e, "step skipped");
                        Chain::Done
                    }
                }
            }
        }
    }

    /// Execute one step. Returns `true` when the approval gate suspended the run.
    fn advance(&self, run_id: &str, epoch: u64) -> Result<bool, AgentError> {
        let mut gated = false;
        let run = self.inner.registry.transition(run_id, |current| {
            if !lifecycle::can_advance(current.status) {
                return Err(superseded(current, "advance"));
            }
            let mut executions = self.executions();
            let exec = executions
                .get_mut(run_id)
                .filter(|e| e.epoch == epoch && e.current_step < e.steps.len())
                .ok_or_else(|| superseded(current, "advance"))?;

            let step = exec.steps[exec.current_step].clone();
            let next = exec.current_step + 1;
            let progress = current
                .progress_pct
                .max(lifecycle::progress_for(next, exec.steps.len()));

            let mut patch = RunPatch {
                status: Some(RunStatus::Running),
                current_step: Some(next as u32),
                progress_pct: Some(progress),
                latest_update: Some(if exec.concise {
                    CONCISE_UPDATE.to_string()
                } else {
                    step.clone()
                }),
                ..Default::default()
            };
            let mut posts = Vec::new();
            if !exec.concise {
                posts.push(ThreadPost::Text(format!("Step {}: {}", next, step)));
            }

            let gate = if exec.gate_cleared {
                None
            } else {
                self.inner.policies.evaluate(&GateContext {
                    request_text: &exec.request_text,
                    steps: &exec.steps,
                    require_approval: exec.require_approval,
                    planner_declared: exec.planner_declared,
                })
            };
            if let Some(policy_reason) = gate {
                let reason = exec
                    .approval_reason
                    .clone()
                    .filter(|_| exec.planner_declared)
                    .unwrap_or(policy_reason);
                patch.status = Some(RunStatus::NeedsApproval);
                patch.latest_update = Some("Waiting for approval".to_string());
                patch.approval = Some(ApprovalState {
                    required: true,
                    pending: true,
                    reason: Some(reason.clone()),
                });
                posts.push(ThreadPost::Text(format!(
                    "Approval gate: {} Use Approve or Deny.",
                    reason
                )));
                gated = true;
            }

            exec.current_step = next;
            Ok(Transition { patch, posts })
        })?;

        if gated {
            tracing::info!(
                run_id = %run.id,
                step = run.current_step,
                reason = run.approval.reason.as_deref().unwrap_or_default(),
                "run waiting for approval"
            );
        } else {
            tracing::debug!(run_id = %run.id, step = run.current_step, total = run.total_steps, "step executed");
        }
        Ok(gated)
    }

    fn deliver(&self, run_id: &str, epoch: u64) -> Result<Run, AgentError> {
        let run = self.inner.registry.transition(run_id, |current| {
            if !lifecycle::is_valid_transition(current.status, RunStatus::Completed) {
                return Err(superseded(current, "deliver"));
            }
            let mut executions = self.executions();
            if executions.get(run_id).is_none_or(|e| e.epoch != epoch) {
                return Err(superseded(current, "deliver"));
            }
            let exec = executions
                .remove(run_id)
                .ok_or_else(|| superseded(current, "deliver"))?;

            let title = exec.deliverable_title;
            Ok(Transition::patch(RunPatch {
                status: Some(RunStatus::Completed),
                current_step: Some(exec.steps.len() as u32),
                progress_pct: Some(100),
                latest_update: Some(format!("Delivered: {}", current.title)),
                ..Default::default()
            })
            .post(ThreadPost::Deliverable {
                body: deliverable::build_body(&title, &exec.summary),
                links: deliverable::artifact_links(current),
                title,
            }))
        })?;
        tracing::info!(run_id = %run.id, title = %run.title, "run completed");
        Ok(run)
    }
}

impl std::fmt::Debug for RunEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEngine")
            .field("planner", &self.inner.planner)
            .field("policies", &self.inner.policies)
            .field("timing", &self.inner.timing)
            .finish()
    }
}
