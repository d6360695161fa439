use std::io::{self, Write};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::builder::BuildResult;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn phase(phase: impl std::fmt::Display, detail: impl std::fmt::Display) -> Self {
        Self {
            message: format!("phase={phase}; {detail}"),
            elapsed: None,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Machine-readable output: results go to stdout as JSON, progress is dropped.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_build(result: &BuildResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress as plain lines on stderr, mirrored to the tracing log.
pub struct LogOutput;

impl ProgressSink for LogOutput {
    fn event(&self, event: ProgressEvent) {
        info!(message = %event.message, "progress");
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

pub fn print_build_summary(result: &BuildResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}build {} -> {} ({}){reset}", result.build, result.target, result.state);
    for stats in &result.sources {
        println!(
            "{green}  {}: read {}, invalid {}, filtered {}, suppressed {}, dropped {}, translated {}{reset}",
            stats.source,
            stats.read,
            stats.invalid,
            stats.filtered,
            stats.suppressed,
            stats.dropped,
            stats.translated
        );
    }
    println!(
        "{green}documents written: {} (orphaned: {}){reset}",
        result.documents_written, result.orphaned
    );
    if result.cancelled {
        println!("{yellow}cancelled before all sources were read{reset}");
    }
    if !result.errors.is_empty() {
        println!("{yellow}record errors (first {}):{reset}", result.errors.len());
        for error in &result.errors {
            println!("{yellow}  {error}{reset}");
        }
    }
}
