//! Optimistic flows: show the predicted result first, then settle on the server's answer.

use super::projection::ClientProjection;
use super::transport::AgentTransport;
use crate::agent::models::{AgentCommand, ApprovalDecision, ControlAction, Run};
use crate::errors::ClientError;

/// Text used in the failure notice for a failed call.
pub fn failure_detail(err: &ClientError) -> String {
    match err {
        ClientError::Status { message, .. } => message.clone(),
        ClientError::Http(e) if e.is_connect() => "Agent backend unavailable".to_string(),
        other => other.to_string(),
    }
}

/// Submit a command. The projection shows a provisional run until the
/// response arrives; on failure it is discarded, one notice is posted and
/// the error is returned. Nothing is retried. A follow-up on a run awaiting
/// approval is rejected locally.
pub async fn submit_command<T>(
    projection: &mut ClientProjection,
    transport: &T,
    command: AgentCommand,
) -> Result<Run, ClientError>
where
    T: AgentTransport + ?Sized,
{
    projection.check_continuation(&command)?;
    let provisional = projection.begin(&command);
    match transport.submit_command(&command).await {
        Ok(run) => Ok(projection.reconcile(provisional, run)),
        Err(e) => {
            tracing::warn!(error = %e, provisional = %provisional.run_id, "command submission failed");
            projection.fail_submission(provisional, &command, &failure_detail(&e));
            Err(e)
        }
    }
}

/// Pause, stop or resume. A move the transition table forbids is rejected
/// locally without a round trip.
pub async fn control_run<T>(
    projection: &mut ClientProjection,
    transport: &T,
    run_id: &str,
    action: ControlAction,
) -> Result<Run, ClientError>
where
    T: AgentTransport + ?Sized,
{
    let previous = projection.run(run_id).cloned();
    projection.predict_control(run_id, action)?;
    let outcome = transport.control(run_id, action).await;
    settle(projection, previous, outcome)
}

/// Approve or deny a gated run, predicted the same way as [`control_run`].
pub async fn decide_run<T>(
    projection: &mut ClientProjection,
    transport: &T,
    run_id: &str,
    decision: ApprovalDecision,
) -> Result<Run, ClientError>
where
    T: AgentTransport + ?Sized,
{
    let previous = projection.run(run_id).cloned();
    projection.predict_decision(run_id, decision)?;
    let outcome = transport.decide(run_id, decision).await;
    settle(projection, previous, outcome)
}

/// Fetch the authoritative record and fold it in under the stale rules.
pub async fn refresh_run<T>(
    projection: &mut ClientProjection,
    transport: &T,
    run_id: &str,
) -> Result<Run, ClientError>
where
    T: AgentTransport + ?Sized,
{
    let run = transport.get_run(run_id).await?;
    projection.upsert_run(run.clone());
    Ok(projection.run(run_id).cloned().unwrap_or(run))
}

fn settle(
    projection: &mut ClientProjection,
    previous: Option<Run>,
    outcome: Result<Run, ClientError>,
) -> Result<Run, ClientError> {
    match outcome {
        Ok(run) => {
            let id = run.id.clone();
            // The server's answer replaces the prediction outright.
            projection.restore_run(run.clone());
            Ok(projection.run(&id).cloned().unwrap_or(run))
        }
        Err(e) => {
            if let Some(previous) = previous {
                projection.restore_run(previous);
            }
            Err(e)
        }
    }
}
