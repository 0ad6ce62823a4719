//! Tracing subscriber setup for the binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::agent_config::LoggingSection;

const LOG_FILE_PREFIX: &str = "workspace-agent.log";

/// Directive used when `RUST_LOG` is unset. `--verbose` raises the crate to debug.
pub fn filter_directive(configured: &str, verbose: bool) -> String {
    if verbose {
        format!("{},workspace_agent=debug", configured)
    } else {
        configured.to_string()
    }
}

fn build_filter(section: &LoggingSection, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(filter_directive(&section.filter, verbose))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber: stderr (plain or JSON) plus an optional
/// daily-rolling file. Keep the returned guard alive until exit so buffered
/// file output is flushed.
pub fn init_tracing(
    section: &LoggingSection,
    log_dir: Option<PathBuf>,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let stderr_layer = if section.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(section, verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_passthrough() {
        assert_eq!(filter_directive("warn", false), "warn");
    }

    #[test]
    fn test_verbose_raises_crate_level() {
        let directive = filter_directive("info", true);
        assert_eq!(directive, "info,workspace_agent=debug");
        assert!(EnvFilter::try_new(&directive).is_ok());
    }

    #[test]
    fn test_invalid_configured_filter_falls_back() {
        let section = LoggingSection {
            filter: "workspace_agent=loud".into(),
            ..Default::default()
        };
        // Must not panic; the fallback keeps logging at info.
        let _ = build_filter(&section, false);
    }
}
