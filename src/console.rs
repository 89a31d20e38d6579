//! Dual-sink output: every line goes to the terminal (styled) and to the
//! session log file (plain), plus the section timer built on top of it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use colored::*;
use tracing_subscriber::EnvFilter;

use crate::error::RecoveryError;
use crate::executor::Outcome;

/// Timestamp shape shared by log names and backup suffixes.
pub const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Gives up on disambiguating same-second log names after this many tries.
const MAX_LOG_ATTEMPTS: u32 = 100;

/// One invocation's log file. Written to, never read back.
#[derive(Debug, Clone)]
pub struct LogSession {
    pub path: PathBuf,
    pub started: DateTime<Local>,
}

impl LogSession {
    /// `attempt` > 0 adds a `-N` suffix for runs started in the same second.
    pub fn file_name(started: &DateTime<Local>, attempt: u32) -> String {
        let stamp = started.format(STAMP_FORMAT);
        if attempt == 0 {
            format!("nvidia-recovery-{}.log", stamp)
        } else {
            format!("nvidia-recovery-{}-{}.log", stamp, attempt)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Tone {
    Plain,
    Header,
    Detail,
    Command,
    Success,
    Warning,
    Failure,
    ChildErr,
}

pub struct Console {
    log: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    pub fn with_writer(log: Box<dyn Write + Send>) -> Self {
        Self { log: Mutex::new(log) }
    }

    /// Creates the log directory if needed and opens a log file no other
    /// run has used.
    pub fn open(log_dir: &Path) -> Result<(Self, LogSession)> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log dir: {}", log_dir.display()))?;

        let started = Local::now();
        let mut attempt = 0;
        loop {
            let path = log_dir.join(LogSession::file_name(&started, attempt));
            match OpenOptions::new().create_new(true).append(true).open(&path) {
                Ok(file) => {
                    return Ok((Self::with_writer(Box::new(file)), LogSession { path, started }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt + 1 < MAX_LOG_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to open log file: {}", path.display()));
                }
            }
        }
    }

    pub fn header(&self, text: &str) {
        self.emit(Tone::Header, text);
    }

    pub fn info(&self, text: &str) {
        self.emit(Tone::Plain, text);
    }

    /// Indented follow-up line under a header.
    pub fn detail(&self, text: &str) {
        self.emit(Tone::Detail, text);
    }

    pub fn command(&self, line: &str) {
        self.emit(Tone::Command, line);
    }

    pub fn success(&self, text: &str) {
        self.emit(Tone::Success, text);
    }

    pub fn warn(&self, text: &str) {
        self.emit(Tone::Warning, text);
    }

    pub fn failure(&self, text: &str) {
        self.emit(Tone::Failure, text);
    }

    /// A line a child process wrote to stdout.
    pub fn child_out(&self, line: &str) {
        self.emit(Tone::Plain, line);
    }

    /// A line a child process wrote to stderr.
    pub fn child_err(&self, line: &str) {
        self.emit(Tone::ChildErr, line);
    }

    pub fn begin_section(&self, name: &str) -> Section<'_> {
        self.emit(Tone::Header, &format!("▶ {}", name));
        Section { console: self, name: name.to_string(), started: Instant::now() }
    }

    fn emit(&self, tone: Tone, text: &str) {
        let plain = match tone {
            Tone::Header => format!("\n{}", text),
            Tone::Detail | Tone::Success | Tone::Warning | Tone::Failure => format!("   {}", text),
            Tone::Command => format!("   $ {}", text),
            Tone::Plain | Tone::ChildErr => text.to_string(),
        };

        match tone {
            Tone::Header => println!("\n{}", text.blue().bold()),
            Tone::Command => println!("   {}", format!("$ {}", text).cyan()),
            Tone::Success => println!("   {}", text.green()),
            Tone::Warning => println!("   {}", text.yellow()),
            Tone::Failure => eprintln!("   {}", text.red().bold()),
            Tone::ChildErr => eprintln!("{}", text),
            Tone::Detail | Tone::Plain => println!("{}", plain),
        }

        // Best effort: a failed log write never aborts a step.
        if let Ok(mut log) = self.log.lock() {
            let _ = writeln!(log, "{}", plain);
        }
    }

    pub fn flush(&self) {
        if let Ok(mut log) = self.log.lock() {
            let _ = log.flush();
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Routes `tracing` records into the session log, without colour.
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing(session: &LogSession) -> Result<()> {
    let file = OpenOptions::new()
        .append(true)
        .open(&session.path)
        .with_context(|| format!("Failed to reopen log file: {}", session.path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gnome_nvidia_recovery=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;
    Ok(())
}

/// A labelled, timed step. Created by [`Console::begin_section`]; the step's
/// own outcome is handed to [`Section::finish`].
pub struct Section<'a> {
    console: &'a Console,
    name: String,
    started: Instant,
}

#[derive(Debug, Clone)]
pub struct SectionResult {
    pub name: String,
    pub elapsed: Duration,
    pub outcome: Outcome,
}

impl SectionResult {
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed.as_secs()
    }
}

impl Section<'_> {
    pub fn finish(self, outcome: Outcome) -> Result<SectionResult, RecoveryError> {
        let result = SectionResult {
            name: self.name,
            elapsed: self.started.elapsed(),
            outcome,
        };

        match outcome {
            Outcome::Success => {
                self.console
                    .success(&format!("✅ {} ({}s)", result.name, result.elapsed_secs()));
                Ok(result)
            }
            Outcome::Failed { code } => {
                self.console.failure(&format!(
                    "❌ {} failed (exit {}) after {}s",
                    result.name,
                    code,
                    result.elapsed_secs()
                ));
                self.console.flush();
                Err(RecoveryError::StepFailed { step: result.name, code })
            }
        }
    }
}
