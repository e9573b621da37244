use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Keeps the non-blocking writer alive for the process lifetime.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Where log lines go. Anything that is not a well-known sink name is a
/// file path.
enum LogTarget {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl LogTarget {
    fn parse(output: &str) -> Self {
        match output.trim() {
            "" | "stderr" => LogTarget::Stderr,
            "stdout" => LogTarget::Stdout,
            "discard" => LogTarget::Discard,
            path => LogTarget::File(PathBuf::from(path)),
        }
    }

    fn open(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        let pair = match self {
            LogTarget::Stderr => tracing_appender::non_blocking(std::io::stderr()),
            LogTarget::Stdout => tracing_appender::non_blocking(std::io::stdout()),
            LogTarget::Discard => tracing_appender::non_blocking(std::io::sink()),
            LogTarget::File(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("logging: create log dir {}", dir.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("logging: open log file {}", path.display()))?;
                tracing_appender::non_blocking(file)
            }
        };
        Ok(pair)
    }

    /// Color only makes sense on an interactive terminal.
    fn supports_ansi(&self) -> bool {
        match self {
            LogTarget::Stderr => std::io::stderr().is_terminal(),
            LogTarget::Stdout => std::io::stdout().is_terminal(),
            LogTarget::Discard | LogTarget::File(_) => false,
        }
    }
}

pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let target = LogTarget::parse(&cfg.output);
    let (writer, guard) = target.open()?;

    // RUST_LOG wins over the configured level; an unparseable level falls
    // back to info rather than refusing to start.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => {
            let level = cfg
                .level
                .trim()
                .parse::<tracing::Level>()
                .unwrap_or(tracing::Level::INFO);
            EnvFilter::new(level.as_str())
        }
    };

    let lines = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_file(cfg.include_location)
        .with_line_number(cfg.include_location);

    if cfg.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(lines.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(lines.with_ansi(target.supports_ansi()))
            .try_init()
    }
    .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() {
        assert!(matches!(LogTarget::parse(""), LogTarget::Stderr));
        assert!(matches!(LogTarget::parse(" stderr "), LogTarget::Stderr));
        assert!(matches!(LogTarget::parse("stdout"), LogTarget::Stdout));
        assert!(matches!(LogTarget::parse("discard"), LogTarget::Discard));
        match LogTarget::parse("/var/log/shroud.log") {
            LogTarget::File(p) => assert_eq!(p, PathBuf::from("/var/log/shroud.log")),
            _ => panic!("expected a file target"),
        }
    }

    #[test]
    fn file_targets_never_color() {
        assert!(!LogTarget::parse("out.log").supports_ansi());
        assert!(!LogTarget::parse("discard").supports_ansi());
    }
}
