//! Pure text classifiers consumed by the run engine.
//!
//! Nothing here touches run state; every function maps request text (and
//! sometimes step text) to a small enum or string so it can be tested in
//! isolation and swapped behind the approval policies in `approval.rs`.

use std::sync::LazyLock;

use regex::Regex;

use super::models::{Container, OutputFormat};

static RISKY_VERB_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(send|delete|deploy|create calendar event|push|merge)\b").unwrap()
});

static SUMMARY_INTENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(summarize|summarise|summary|recap|brief|tl;dr|digest)\b").unwrap());

static COMPLEX_INTENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(compare|deep|analy[sz]e|investigate|multi-step|plan)\b").unwrap());

static TODO_INTENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(to-?do|todo|action items?|tasks?|next steps?)\b").unwrap()
});

/// Verbs the risk heuristic looks for; also handed to the plan proposer.
pub const RISKY_VERBS: [&str; 6] = [
    "send",
    "delete",
    "deploy",
    "create calendar event",
    "push",
    "merge",
];

/// Fixed steps a concise run executes instead of the proposed plan.
pub const CONCISE_STEPS: [&str; 2] = ["Gathering context", "Composing concise summary"];

pub const TODO_RUN_TITLE: &str = "To-do list";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Risk {
    Safe,
    /// The first risky verb found, lowercased.
    Risky(String),
}

impl Risk {
    pub fn is_risky(&self) -> bool {
        matches!(self, Risk::Risky(_))
    }
}

/// Classify a single piece of text against the risky verb list.
pub fn classify_risk(text: &str) -> Risk {
    match RISKY_VERB_REGEX.find(text) {
        Some(m) => Risk::Risky(m.as_str().to_lowercase()),
        None => Risk::Safe,
    }
}

/// Risk across the request and every planned step; the request wins ties.
pub fn classify_request_risk(text: &str, steps: &[String]) -> Risk {
    std::iter::once(text)
        .chain(steps.iter().map(String::as_str))
        .map(classify_risk)
        .find(Risk::is_risky)
        .unwrap_or(Risk::Safe)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Full,
    /// Two fixed steps, no interim narration.
    Concise,
}

/// A plain summarization request runs concise unless it asks for analysis
/// or targets a pull request.
pub fn request_mode(text: &str, format: OutputFormat) -> RequestMode {
    if format == OutputFormat::Pr {
        return RequestMode::Full;
    }
    let normalized = text.trim().to_lowercase();
    let summary_intent = SUMMARY_INTENT_REGEX.is_match(&normalized)
        || normalized.starts_with("summarize")
        || normalized.starts_with("summary");
    let complex_intent = COMPLEX_INTENT_REGEX.is_match(&normalized);
    if summary_intent && !complex_intent {
        RequestMode::Concise
    } else {
        RequestMode::Full
    }
}

pub fn is_todo_intent(text: &str) -> bool {
    TODO_INTENT_REGEX.is_match(text)
}

pub fn run_title(request_text: &str, proposed_title: &str) -> String {
    if is_todo_intent(request_text) {
        TODO_RUN_TITLE.to_string()
    } else {
        proposed_title.to_string()
    }
}

pub fn deliverable_title(request_text: &str, run_title: &str, container: &Container) -> String {
    if is_todo_intent(request_text) {
        format!("To-Do's from {}", container.label())
    } else {
        run_title.to_string()
    }
}

/// Shorten `text` to `max` characters, marking the cut with `...`.
pub fn truncate_title(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}
