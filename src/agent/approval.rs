//! Approval gate policies.
//!
//! The gate fires when any configured policy returns a reason. Each source of
//! "this run needs a human" is its own [`ApprovalPolicy`] so deployments can
//! decide whether the planner's own judgement or the local risk heuristic
//! take part, without touching the engine.

use std::sync::Arc;

use super::classify::{self, Risk};

/// Everything a policy may look at when the engine evaluates the gate.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub request_text: &'a str,
    pub steps: &'a [String],
    pub require_approval: bool,
    pub planner_declared: bool,
}

pub trait ApprovalPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Some(reason)` when this policy wants the run held for approval.
    fn evaluate(&self, ctx: &GateContext<'_>) -> Option<String>;
}

/// The requester asked for approval explicitly.
pub struct ExplicitRequest;

impl ApprovalPolicy for ExplicitRequest {
    fn name(&self) -> &'static str {
        "explicit_request"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> Option<String> {
        ctx.require_approval
            .then(|| "Approval required by settings.".to_string())
    }
}

/// The plan proposer flagged the plan itself.
pub struct PlannerDeclared;

impl ApprovalPolicy for PlannerDeclared {
    fn name(&self) -> &'static str {
        "planner_declared"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> Option<String> {
        ctx.planner_declared
            .then(|| "The plan includes actions that need sign-off.".to_string())
    }
}

/// Risky verbs in the request or any planned step.
pub struct RiskHeuristic;

impl ApprovalPolicy for RiskHeuristic {
    fn name(&self) -> &'static str {
        "risk_heuristic"
    }

    fn evaluate(&self, ctx: &GateContext<'_>) -> Option<String> {
        match classify::classify_request_risk(ctx.request_text, ctx.steps) {
            Risk::Risky(verb) => Some(format!(
                "Potentially risky action detected ({}).",
                verb
            )),
            Risk::Safe => None,
        }
    }
}

/// Ordered set of policies; the first one that fires supplies the reason.
#[derive(Clone)]
pub struct ApprovalPolicies {
    policies: Vec<Arc<dyn ApprovalPolicy>>,
}

impl ApprovalPolicies {
    pub fn new(policies: Vec<Arc<dyn ApprovalPolicy>>) -> Self {
        Self { policies }
    }

    /// Build the policy set from the `[approval]` config switches.
    pub fn from_switches(honor_planner: bool, risk_heuristic: bool) -> Self {
        let mut policies: Vec<Arc<dyn ApprovalPolicy>> = vec![Arc::new(ExplicitRequest)];
        if honor_planner {
            policies.push(Arc::new(PlannerDeclared));
        }
        if risk_heuristic {
            policies.push(Arc::new(RiskHeuristic));
        }
        Self::new(policies)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.policies.iter().map(|p| p.name()).collect()
    }

    pub fn evaluate(&self, ctx: &GateContext<'_>) -> Option<String> {
        self.policies.iter().find_map(|p| p.evaluate(ctx))
    }
}

impl Default for ApprovalPolicies {
    fn default() -> Self {
        Self::from_switches(true, true)
    }
}

impl std::fmt::Debug for ApprovalPolicies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
