//! Run status transitions and the progression decision.
//!
//! Shared by the authoritative engine and the client projection so both
//! tiers enforce the same table.

use super::models::{ApprovalDecision, ControlAction, RunStatus};

/// Progress never reaches 100 until the deliverable is posted.
pub const MAX_IN_FLIGHT_PROGRESS: u8 = 95;

/// A status change the table does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub from: RunStatus,
    pub action: &'static str,
}

/// Validate that a run status transition is valid.
pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Queued, Running)
            | (Queued, Paused)
            | (Queued, Stopped)
            | (Running, NeedsApproval)
            | (Running, Paused)
            | (Running, Stopped)
            | (Running, Completed)
            | (NeedsApproval, Running)
            | (NeedsApproval, Failed)
            | (NeedsApproval, Stopped)
            | (Paused, Running)
            | (Paused, Stopped)
    )
}

/// Whether a progression tick may advance a run in this status.
pub fn can_advance(status: RunStatus) -> bool {
    matches!(status, RunStatus::Queued | RunStatus::Running)
}

pub fn control_target(current: RunStatus, action: ControlAction) -> Result<RunStatus, Rejected> {
    let target = match action {
        ControlAction::Pause => RunStatus::Paused,
        ControlAction::Resume => RunStatus::Running,
        ControlAction::Stop => RunStatus::Stopped,
    };
    let allowed = match action {
        ControlAction::Pause => can_advance(current),
        ControlAction::Resume => current == RunStatus::Paused,
        ControlAction::Stop => !current.is_terminal(),
    };
    if allowed {
        Ok(target)
    } else {
        Err(Rejected {
            from: current,
            action: action.as_str(),
        })
    }
}

pub fn decision_target(current: RunStatus, decision: ApprovalDecision) -> Result<RunStatus, Rejected> {
    match (current, decision) {
        (RunStatus::NeedsApproval, ApprovalDecision::Approve) => Ok(RunStatus::Running),
        (RunStatus::NeedsApproval, ApprovalDecision::Deny) => Ok(RunStatus::Failed),
        (from, ApprovalDecision::Approve) => Err(Rejected {
            from,
            action: "approve",
        }),
        (from, ApprovalDecision::Deny) => Err(Rejected { from, action: "deny" }),
    }
}

/// `latest_update` a control action leaves on the run.
pub fn control_update(action: ControlAction) -> &'static str {
    match action {
        ControlAction::Pause => "Paused by user",
        ControlAction::Stop => "Stopped by user",
        ControlAction::Resume => "Resumed",
    }
}

pub fn decision_update(decision: ApprovalDecision) -> &'static str {
    match decision {
        ApprovalDecision::Approve => "Approval granted, resuming",
        ApprovalDecision::Deny => "Denied",
    }
}

/// What a progression tick should do after re-reading live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Status no longer allows progress; drop the chain.
    Halt,
    /// Every step has run; post the deliverable and complete.
    Deliver,
    /// Execute the step at `current_step`.
    Advance,
}

pub fn next_action(status: RunStatus, current_step: usize, total_steps: usize) -> NextAction {
    if !can_advance(status) {
        NextAction::Halt
    } else if current_step >= total_steps {
        NextAction::Deliver
    } else {
        NextAction::Advance
    }
}

/// `min(95, floor(current / total * 100))`.
pub fn progress_for(current_step: usize, total_steps: usize) -> u8 {
    if total_steps == 0 {
        return 0;
    }
    let pct = (current_step * 100) / total_steps;
    pct.min(MAX_IN_FLIGHT_PROGRESS as usize) as u8
}
