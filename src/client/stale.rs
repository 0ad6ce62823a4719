//! Out-of-order update suppression.
//!
//! The direct command response and the push channel both describe the same
//! mutation and can arrive in either order. An incoming record is dropped
//! when it would move a run backwards.

use crate::agent::models::{Run, RunStatus};

/// Whether `incoming` is an older view of `current` and must not replace it.
///
/// Only records with the same identity and creation time are compared; a
/// different `created_at` means a new run reusing the id, which always wins.
pub fn should_ignore(current: &Run, incoming: &Run) -> bool {
    if current.id != incoming.id || current.created_at != incoming.created_at {
        return false;
    }
    if current.status.is_terminal() && !incoming.status.is_terminal() {
        return true;
    }
    if current.status == RunStatus::Running && incoming.status == RunStatus::Queued {
        return true;
    }
    current.progress_pct > incoming.progress_pct && incoming.status == RunStatus::Queued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::models::{ApprovalState, Container};

    fn run(status: RunStatus, progress_pct: u8) -> Run {
        Run {
            id: "run-1".into(),
            title: "Weekly recap".into(),
            created_at: 1_000,
            created_by: "you".into(),
            container: Container::channel("general"),
            root_message_id: "msg-1".into(),
            thread_id: "msg-1".into(),
            status,
            current_step: 0,
            total_steps: 4,
            progress_pct,
            latest_update: String::new(),
            artifacts: vec![],
            approval: ApprovalState::default(),
            autopilot_id: None,
        }
    }

    #[test]
    fn test_terminal_is_never_reopened() {
        for terminal in [RunStatus::Completed, RunStatus::Failed, RunStatus::Stopped] {
            for incoming in [
                RunStatus::Queued,
                RunStatus::Running,
                RunStatus::NeedsApproval,
                RunStatus::Paused,
            ] {
                assert!(
                    should_ignore(&run(terminal, 100), &run(incoming, 100)),
                    "{terminal} <- {incoming}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_to_terminal_is_accepted() {
        assert!(!should_ignore(
            &run(RunStatus::Stopped, 50),
            &run(RunStatus::Completed, 100)
        ));
    }

    #[test]
    fn test_running_never_regresses_to_queued() {
        assert!(should_ignore(&run(RunStatus::Running, 0), &run(RunStatus::Queued, 0)));
    }

    #[test]
    fn test_queued_with_lower_progress_is_dropped() {
        assert!(should_ignore(&run(RunStatus::Paused, 40), &run(RunStatus::Queued, 0)));
        assert!(!should_ignore(&run(RunStatus::Queued, 0), &run(RunStatus::Queued, 0)));
    }

    #[test]
    fn test_forward_updates_are_accepted() {
        assert!(!should_ignore(&run(RunStatus::Running, 25), &run(RunStatus::Running, 50)));
        assert!(!should_ignore(&run(RunStatus::Running, 50), &run(RunStatus::NeedsApproval, 50)));
        assert!(!should_ignore(&run(RunStatus::NeedsApproval, 50), &run(RunStatus::Failed, 50)));
        assert!(!should_ignore(&run(RunStatus::Running, 50), &run(RunStatus::Paused, 50)));
    }

    #[test]
    fn test_different_creation_time_bypasses_rules() {
        let current = run(RunStatus::Completed, 100);
        let mut incoming = run(RunStatus::Running, 0);
        incoming.created_at = 2_000;
        assert!(!should_ignore(&current, &incoming));

        incoming.created_at = current.created_at;
        incoming.id = "run-2".into();
        assert!(!should_ignore(&current, &incoming));
    }
}
