//! Typed error hierarchy for the workspace agent.
//!
//! Two top-level enums cover the two sides of the wire:
//! - `AgentError`: run lifecycle, autopilot and registry failures (server side)
//! - `ClientError`: transport and prediction failures seen by the client projection

use thiserror::Error;

use crate::agent::models::RunStatus;

/// Errors from the agent runtime. The HTTP layer maps these onto status codes.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Run {id} not found")]
    RunNotFound { id: String },

    #[error("Autopilot {id} not found")]
    AutopilotNotFound { id: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Cannot {action} run {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: RunStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from talking to the agent server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode server response: {0}")]
    Decode(String),

    #[error("Run {id} is not in the local projection")]
    UnknownRun { id: String },

    #[error("Cannot {action} run {id} while it is {from}")]
    Rejected {
        id: String,
        from: RunStatus,
        action: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_run_not_found_carries_id() {
        let err = AgentError::RunNotFound { id: "run-42".into() };
        match &err {
            AgentError::RunNotFound { id } => assert_eq!(id, "run-42"),
            _ => panic!("Expected RunNotFound"),
        }
        assert!(err.to_string().contains("run-42"));
    }

    #[test]
    fn agent_error_invalid_transition_message() {
        let err = AgentError::InvalidTransition {
            id: "r1".into(),
            from: RunStatus::Completed,
            action: "pause",
        };
        assert_eq!(err.to_string(), "Cannot pause run r1 while it is completed");
    }

    #[test]
    fn agent_error_converts_from_anyhow() {
        let err: AgentError = anyhow::anyhow!("disk on fire").into();
        assert!(matches!(err, AgentError::Other(_)));
        assert_eq!(err.to_string(), "disk on fire");
    }

    #[test]
    fn agent_error_variants_are_distinct() {
        let run_err = AgentError::RunNotFound { id: "x".into() };
        let ap_err = AgentError::AutopilotNotFound { id: "x".into() };
        assert!(matches!(run_err, AgentError::RunNotFound { .. }));
        assert!(matches!(ap_err, AgentError::AutopilotNotFound { .. }));
        assert!(!matches!(run_err, AgentError::AutopilotNotFound { .. }));
    }

    #[test]
    fn client_error_status_is_matchable() {
        let err = ClientError::Status {
            status: 409,
            message: "Cannot resume".into(),
        };
        assert!(matches!(err, ClientError::Status { status: 409, .. }));
        assert!(err.to_string().contains("409"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AgentError::Validation("x".into()));
        assert_std_error(&ClientError::Decode("x".into()));
        assert_std_error(&ClientError::UnknownRun { id: "x".into() });
    }
}
