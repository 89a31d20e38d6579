use crate::error::RecoveryError;

pub const USAGE: &str = "\
Usage: gnome-nvidia-recovery [--dry-run] [--detect-only] [--help]

Repairs a GNOME + Wayland + NVIDIA desktop after an OS or kernel upgrade:
installs matching kernel headers, DKMS, the recommended NVIDIA driver and its
utilities, enables DRM modesetting and resets ~/.config/monitors.xml.

Options:
  --dry-run       Print every command without executing it
  --detect-only   Detect the GPU and recommended driver, then stop (implies --dry-run)
  -h, --help      Show this help message

Logs go to $XDG_STATE_HOME/gnome-nvidia-recovery (default ~/.local/state/gnome-nvidia-recovery).";

/// Run modes picked on the command line. `detect_only` always implies `dry_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    dry_run: bool,
    detect_only: bool,
}

impl RunConfig {
    pub fn new(dry_run: bool, detect_only: bool) -> Self {
        Self { dry_run: dry_run || detect_only, detect_only }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn detect_only(&self) -> bool {
        self.detect_only
    }

    /// Label used in the summary and the log header.
    pub fn mode_label(&self) -> &'static str {
        match (self.detect_only, self.dry_run) {
            (true, _) => "detect-only",
            (false, true) => "dry-run",
            (false, false) => "live",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Invocation {
    Help,
    Run(RunConfig),
}

/// Parses everything after the program name.
/// `--help` wins over anything else on the line, including unknown tokens.
pub fn parse_args<I, S>(args: I) -> Result<Invocation, RecoveryError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut dry_run = false;
    let mut detect_only = false;
    let mut unknown = None;

    for arg in args {
        match arg.as_ref() {
            "--help" | "-h" => return Ok(Invocation::Help),
            "--dry-run" => dry_run = true,
            "--detect-only" => detect_only = true,
            other => {
                if unknown.is_none() {
                    unknown = Some(other.to_string());
                }
            }
        }
    }

    match unknown {
        Some(token) => Err(RecoveryError::Usage { token }),
        None => Ok(Invocation::Run(RunConfig::new(dry_run, detect_only))),
    }
}
