//! The single chokepoint for everything that touches the system.
//!
//! Mutating steps are described as [`Action`] values and handed to
//! [`Executor::perform`], which echoes them and, outside dry-run, carries
//! them out. Commands are always an explicit argv; nothing is re-parsed by a
//! shell.

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Instant;
use anyhow::{Context, Result, bail};
use tempfile::NamedTempFile;

use crate::console::Console;

/// What a step reports back to its section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed { code: i32 },
}

/// Exit status the shell reports for a command it cannot find.
const NOT_FOUND_STATUS: i32 = 127;

/// A program plus explicit arguments. `privileged` commands get the
/// escalation program (sudo / pkexec) prepended at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub privileged: bool,
}

impl CommandLine {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            privileged: false,
        }
    }

    pub fn privileged<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { privileged: true, ..Self::new(program, args) }
    }

    /// Full argv after escalation is applied.
    fn argv(&self, escalation: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if self.privileged {
            argv.push(escalation.to_string());
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run a command and wait for it.
    Run(CommandLine),
    /// Write `contents` to a root-owned `dest` with permission bits `mode`.
    InstallFile { contents: String, dest: PathBuf, mode: u32 },
    /// Move a user-owned file.
    Rename { from: PathBuf, to: PathBuf },
}

/// Quotes a word for display so the echoed line can be pasted into a shell.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn render_argv(argv: &[String]) -> String {
    argv.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" ")
}

fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

pub struct Executor<'a> {
    console: &'a Console,
    dry_run: bool,
    escalation: String,
}

impl<'a> Executor<'a> {
    pub fn new(console: &'a Console, dry_run: bool, escalation: &str) -> Self {
        Self { console, dry_run, escalation: escalation.to_string() }
    }

    /// The command line echoed for an action.
    pub fn render(&self, action: &Action) -> String {
        match action {
            Action::Run(cmd) => render_argv(&cmd.argv(&self.escalation)),
            Action::InstallFile { dest, mode, .. } => {
                render_argv(&self.install_argv("<staged>", dest, *mode))
            }
            Action::Rename { from, to } => render_argv(&[
                "mv".to_string(),
                from.display().to_string(),
                to.display().to_string(),
            ]),
        }
    }

    /// Echoes the action; executes it unless in dry-run.
    pub fn perform(&self, action: &Action) -> Result<Outcome> {
        self.console.command(&self.render(action));
        if let Action::InstallFile { contents, .. } = action {
            for line in contents.lines() {
                self.console.detail(&format!("| {}", line));
            }
        }

        if self.dry_run {
            self.console.detail("[dry-run] skipped");
            return Ok(Outcome::Success);
        }

        match action {
            Action::Run(cmd) => self.spawn(&cmd.argv(&self.escalation)),
            Action::InstallFile { contents, dest, mode } => self.install_file(contents, dest, *mode),
            Action::Rename { from, to } => match fs::rename(from, to) {
                Ok(()) => Ok(Outcome::Success),
                Err(e) => {
                    self.console
                        .failure(&format!("Failed to move {}: {}", from.display(), e));
                    Ok(Outcome::Failed { code: 1 })
                }
            },
        }
    }

    /// Runs a read-only command in every mode and returns its stdout.
    pub fn query(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        let line = render_argv(&argv);
        self.console.command(&line);

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run '{}', is it installed?", program))?;

        if !output.status.success() {
            bail!(
                "'{}' failed (exit code: {}):\n{}",
                line,
                status_code(output.status),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn install_argv(&self, staged: &str, dest: &Path, mode: u32) -> Vec<String> {
        CommandLine::privileged(
            "install",
            [
                "-m".to_string(),
                format!("{:o}", mode),
                "-o".to_string(),
                "root".to_string(),
                "-g".to_string(),
                "root".to_string(),
                staged.to_string(),
                dest.display().to_string(),
            ],
        )
        .argv(&self.escalation)
    }

    /// Stages the contents in a private temp file, then installs it with root ownership.
    fn install_file(&self, contents: &str, dest: &Path, mode: u32) -> Result<Outcome> {
        let mut staged = NamedTempFile::new().context("Failed to create staging file")?;
        staged.write_all(contents.as_bytes()).context("Failed to write staging file")?;
        staged.flush().context("Failed to write staging file")?;

        let staged_path = staged.path().display().to_string();
        tracing::debug!(staged = %staged_path, dest = %dest.display(), "installing staged file");
        self.spawn(&self.install_argv(&staged_path, dest, mode))
    }

    /// Spawns `argv`, tees its output into the console and waits for it.
    fn spawn(&self, argv: &[String]) -> Result<Outcome> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command line");
        };
        tracing::debug!(%program, ?args, "spawning");
        let started = Instant::now();

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.console.failure(&format!("Command not found: {}", program));
                return Ok(Outcome::Failed { code: NOT_FOUND_STATUS });
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to spawn '{}'", program)),
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let console = self.console;

        let status = thread::scope(|s| {
            if let Some(out) = stdout {
                s.spawn(move || {
                    for line in BufReader::new(out).lines().map_while(Result::ok) {
                        console.child_out(&line);
                    }
                });
            }
            if let Some(err) = stderr {
                s.spawn(move || {
                    for line in BufReader::new(err).lines().map_while(Result::ok) {
                        console.child_err(&line);
                    }
                });
            }
            child.wait()
        })
        .with_context(|| format!("Failed to wait for '{}'", program))?;

        let code = status_code(status);
        tracing::debug!(%program, code, elapsed_ms = started.elapsed().as_millis() as u64, "exited");
        Ok(if status.success() {
            Outcome::Success
        } else {
            Outcome::Failed { code }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::testing::capture;
    use tempfile::TempDir;

    fn sh(script: &str) -> Action {
        Action::Run(CommandLine::new("sh", ["-c", script]))
    }

    #[test]
    fn dry_run_echoes_without_executing() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let (console, buf) = capture();
        let exec = Executor::new(&console, true, "sudo");

        let action = Action::Run(CommandLine::new("touch", [marker.display().to_string()]));
        assert_eq!(exec.perform(&action).unwrap(), Outcome::Success);

        assert!(!marker.exists());
        let log = buf.contents();
        assert!(log.contains(&format!("$ touch {}", marker.display())), "{log}");
        assert!(log.contains("[dry-run] skipped"));
    }

    #[test]
    fn dry_run_leaves_files_in_place() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("monitors.xml");
        let to = dir.path().join("monitors.xml.bak");
        let dest = dir.path().join("modeset.conf");
        fs::write(&from, "<monitors/>").unwrap();

        let (console, buf) = capture();
        let exec = Executor::new(&console, true, "sudo");
        let rename = Action::Rename { from: from.clone(), to: to.clone() };
        let install = Action::InstallFile {
            contents: "options nvidia-drm modeset=1\n".into(),
            dest: dest.clone(),
            mode: 0o644,
        };
        assert_eq!(exec.perform(&rename).unwrap(), Outcome::Success);
        assert_eq!(exec.perform(&install).unwrap(), Outcome::Success);

        assert!(from.exists());
        assert!(!to.exists());
        assert!(!dest.exists());
        let log = buf.contents();
        assert!(log.contains("| options nvidia-drm modeset=1"));
        assert!(log.contains("sudo install -m 644 -o root -g root '<staged>'"));
    }

    #[test]
    fn privileged_commands_get_the_escalation_prefix() {
        let (console, _) = capture();
        let exec = Executor::new(&console, true, "pkexec");
        let action = Action::Run(CommandLine::privileged("apt-get", ["install", "-y", "dkms"]));
        assert_eq!(exec.render(&action), "pkexec apt-get install -y dkms");

        let plain = Action::Run(CommandLine::new("lspci", ["-nn"]));
        assert_eq!(exec.render(&plain), "lspci -nn");
    }

    #[test]
    fn exit_statuses_are_reported() {
        let (console, _) = capture();
        let exec = Executor::new(&console, false, "sudo");
        assert_eq!(exec.perform(&Action::Run(CommandLine::new("true", Vec::<String>::new()))).unwrap(), Outcome::Success);
        assert_eq!(exec.perform(&sh("exit 3")).unwrap(), Outcome::Failed { code: 3 });
        assert_eq!(exec.perform(&sh("kill -9 $$")).unwrap(), Outcome::Failed { code: 137 });
    }

    #[test]
    fn missing_program_maps_to_127() {
        let (console, buf) = capture();
        let exec = Executor::new(&console, false, "sudo");
        let action = Action::Run(CommandLine::new("definitely-not-a-real-binary-xyz", ["x"]));
        assert_eq!(exec.perform(&action).unwrap(), Outcome::Failed { code: 127 });
        assert!(buf.contents().contains("Command not found"));
    }

    #[test]
    fn child_output_is_teed_into_the_log() {
        let (console, buf) = capture();
        let exec = Executor::new(&console, false, "sudo");
        exec.perform(&sh("echo reading package lists; echo warning: noisy >&2")).unwrap();

        let log = buf.contents();
        assert!(log.contains("reading package lists\n"));
        assert!(log.contains("warning: noisy\n"));
    }

    #[test]
    fn live_rename_moves_the_file() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("monitors.xml");
        let to = dir.path().join("monitors.xml.bak-20260101-000000");
        fs::write(&from, "<monitors/>").unwrap();

        let (console, _) = capture();
        let exec = Executor::new(&console, false, "sudo");
        let outcome = exec.perform(&Action::Rename { from: from.clone(), to: to.clone() }).unwrap();

        assert_eq!(outcome, Outcome::Success);
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).unwrap(), "<monitors/>");
    }

    #[test]
    fn failed_rename_is_a_failed_outcome() {
        let dir = TempDir::new().unwrap();
        let (console, _) = capture();
        let exec = Executor::new(&console, false, "sudo");
        let action = Action::Rename {
            from: dir.path().join("absent.xml"),
            to: dir.path().join("absent.xml.bak"),
        };
        assert_eq!(exec.perform(&action).unwrap(), Outcome::Failed { code: 1 });
    }

    #[test]
    fn queries_run_even_in_dry_run() {
        let (console, _) = capture();
        let exec = Executor::new(&console, true, "sudo");
        assert_eq!(exec.query("sh", &["-c", "echo 01:00.0 VGA NVIDIA"]).unwrap(), "01:00.0 VGA NVIDIA\n");
    }

    #[test]
    fn failing_or_missing_queries_are_errors() {
        let (console, _) = capture();
        let exec = Executor::new(&console, true, "sudo");
        let err = exec.query("sh", &["-c", "echo boom >&2; exit 2"]).unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
        assert!(exec.query("definitely-not-a-real-binary-xyz", &[]).is_err());
    }

    #[test]
    fn quoting_only_where_needed() {
        assert_eq!(shell_quote("linux-headers-6.8.0-45-generic"), "linux-headers-6.8.0-45-generic");
        assert_eq!(shell_quote("/home/me/.config/monitors.xml"), "/home/me/.config/monitors.xml");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
