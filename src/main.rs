//! GNOME + Wayland + NVIDIA Recovery (gnome-nvidia-recovery)
//!
//! Puts an Ubuntu GNOME desktop back on its feet after an OS or kernel
//! upgrade breaks the NVIDIA graphics stack.
//! 1. **Detection:** Confirms an NVIDIA GPU via `lspci` and picks the
//!    recommended driver from `ubuntu-drivers devices` (open flavour first).
//! 2. **Rebuild:** Installs headers for the running kernel, DKMS, the driver
//!    and its matching `nvidia-utils` package through `apt-get`.
//! 3. **Wayland:** Enables `nvidia-drm` modesetting and moves a stale
//!    `~/.config/monitors.xml` out of the way.
//! 4. **Safety:** Fail fast. The first failing step stops the run and its
//!    exit status becomes ours. `--dry-run` and `--detect-only` change nothing.
//!
//! Everything printed is mirrored to a timestamped log under
//! `$XDG_STATE_HOME/gnome-nvidia-recovery`.

mod cli;
mod config;
mod console;
mod detect;
mod error;
mod executor;
mod runner;

use std::env;
use std::process::ExitCode;
use anyhow::Result;
use colored::*;

use crate::cli::{Invocation, RunConfig, USAGE};
use crate::config::Settings;
use crate::console::Console;
use crate::error::exit_code_for;
use crate::runner::Runner;

fn main() -> ExitCode {
    let config = match cli::parse_args(env::args().skip(1)) {
        Ok(Invocation::Help) => {
            println!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Ok(Invocation::Run(config)) => config,
        Err(err) => {
            eprintln!("{}", format!("❌ {}", err).red());
            eprintln!("{}", USAGE);
            return ExitCode::from(1);
        }
    };

    match execute(config) {
        Ok(code) => code,
        Err(err) => {
            // Failed before the log was open, so stderr is all we have.
            eprintln!("{}", format!("❌ {:#}", err).red().bold());
            exit_code_for(&err)
        }
    }
}

/// Opens the log session, runs the pipeline and turns its result into a status.
/// The console is dropped (and flushed) before the status reaches `main`.
fn execute(config: RunConfig) -> Result<ExitCode> {
    let settings = Settings::load()?;
    let (console, session) = Console::open(&settings.log_dir)?;
    if let Err(e) = console::init_tracing(&session) {
        console.warn(&format!("⚠️  Diagnostics disabled: {:#}", e));
    }
    tracing::debug!(mode = config.mode_label(), escalation = %settings.escalation, "starting");

    let result = Runner::new(config, &settings, &console, &session).run();
    Ok(match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            console.failure(&format!("❌ {:#}", err));
            console.info(&format!("Log: {}", session.path.display()));
            exit_code_for(&err)
        }
    })
}
