//! Deliverable posted when a run completes.

use regex::Regex;

use super::models::{ArtifactLink, Run};

/// `## {title}` followed by the summary, minus any leading line that only
/// repeats the title as `**title**`, `# title` or `## title`.
pub fn build_body(title: &str, summary: &str) -> String {
    let summary = summary.trim();
    let pattern = format!(
        r"(?i)^(?:\*\*{t}\*\*|#\s+{t}|##\s+{t})\s*\n+",
        t = regex::escape(title)
    );
    let cleaned = match Regex::new(&pattern) {
        Ok(re) => re.replace(summary, "").into_owned(),
        Err(_) => summary.to_string(),
    };
    format!("## {}\n\n{}", title, cleaned).trim().to_string()
}

/// Links attached to the deliverable; the canvas target is the run itself.
pub fn artifact_links(run: &Run) -> Vec<ArtifactLink> {
    vec![ArtifactLink {
        label: "Open Canvas".to_string(),
        target_id: Some(run.id.clone()),
        url: None,
    }]
}
