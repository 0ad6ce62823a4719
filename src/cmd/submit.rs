//! Command submission from the terminal: `workspace-agent submit`.

use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use workspace_agent::agent::models::{AgentCommand, Container, OutputFormat, Run, RunStatus, ThreadRef};
use workspace_agent::client::submit::{refresh_run, submit_command};
use workspace_agent::client::{ClientProjection, HttpAgentClient};

const POLL_INTERVAL: Duration = Duration::from_millis(750);

/// Flags of `submit`, resolved by `main`.
#[derive(Debug, Clone)]
pub struct SubmitArgs {
    pub text: String,
    pub server: String,
    pub channel: String,
    pub dm: Option<String>,
    pub format: OutputFormat,
    pub require_approval: bool,
    pub thread: Option<String>,
    pub run: Option<String>,
    pub watch: bool,
}

impl SubmitArgs {
    /// The command as the server receives it. A continued run supplies the
    /// container and thread, overriding `--channel`, `--dm` and `--thread`.
    pub fn to_command(&self, continued: Option<&Run>) -> AgentCommand {
        let container = match (continued, &self.dm) {
            (Some(run), _) => run.container.clone(),
            (None, Some(user)) => Container::dm(user.clone()),
            (None, None) => Container::channel(self.channel.clone()),
        };
        let mut command = AgentCommand::new(self.text.clone(), container).with_format(self.format);
        if self.require_approval {
            command = command.requiring_approval();
        }
        command.in_thread = match continued {
            Some(run) => Some(ThreadRef {
                thread_id: run.thread_id.clone(),
                run_id: Some(run.id.clone()),
            }),
            None => self.thread.clone().map(|thread_id| ThreadRef {
                thread_id,
                run_id: None,
            }),
        };
        command
    }
}

pub async fn cmd_submit(args: SubmitArgs) -> Result<()> {
    let client = HttpAgentClient::new(&args.server).context("Failed to build HTTP client")?;
    let mut projection = ClientProjection::new();

    // Continuing a run: pull its record first so the prediction can reuse it.
    let continued = match &args.run {
        Some(run_id) => Some(
            refresh_run(&mut projection, &client, run_id)
                .await
                .with_context(|| format!("Failed to fetch run {}", run_id))?,
        ),
        None => None,
    };

    let command = args.to_command(continued.as_ref());
    let run = submit_command(&mut projection, &client, command)
        .await
        .with_context(|| format!("Agent at {} rejected the command", client.base_url()))?;

    print_run(&run);

    if args.watch && !settled(&run) {
        let run = watch_run(&mut projection, &client, &run.id).await?;
        print_run(&run);
    }

    Ok(())
}

/// Nothing more happens without the user once a run is terminal or gated.
fn settled(run: &Run) -> bool {
    run.status.is_terminal() || run.status == RunStatus::NeedsApproval
}

async fn watch_run(
    projection: &mut ClientProjection,
    client: &HttpAgentClient,
    run_id: &str,
) -> Result<Run> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .context("Invalid progress template")?
            .progress_chars("█▓▒░"),
    );
    bar.set_prefix(run_id.to_string());

    loop {
        let run = refresh_run(projection, client, run_id)
            .await
            .with_context(|| format!("Failed to poll run {}", run_id))?;
        bar.set_position(u64::from(run.progress_pct));
        bar.set_message(run.latest_update.clone());

        if settled(&run) {
            bar.finish_and_clear();
            return Ok(run);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_run(run: &Run) {
    let status = match run.status {
        RunStatus::Completed => style(run.status.as_str()).green(),
        RunStatus::Failed | RunStatus::Stopped => style(run.status.as_str()).red(),
        RunStatus::NeedsApproval | RunStatus::Paused => style(run.status.as_str()).yellow(),
        RunStatus::Queued | RunStatus::Running => style(run.status.as_str()).cyan(),
    };

    println!();
    println!("{} {}", style(&run.id).bold(), run.title);
    println!(
        "  {} in {}  step {}/{}  {}%",
        status,
        run.container.label(),
        run.current_step,
        run.total_steps,
        run.progress_pct
    );
    println!("  {}", style(&run.latest_update).dim());
    if run.status == RunStatus::NeedsApproval
        && let Some(reason) = &run.approval.reason
    {
        println!("  {} {}", style("Approval needed:").yellow().bold(), reason);
    }
    for artifact in &run.artifacts {
        println!("  - {}", artifact.title);
    }
    println!();
}
