//! The recovery pipeline: detect, then (unless detect-only) run the ordered
//! mutation steps, then summarise and offer a reboot.
//!
//! Every step is a timed section whose outcome comes straight from the
//! executor. The first failure stops the run; nothing is rolled back.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use anyhow::{Result, anyhow};
use chrono::Local;

use crate::cli::RunConfig;
use crate::config::Settings;
use crate::console::{Console, LogSession, STAMP_FORMAT};
use crate::detect::{self, DriverChoice};
use crate::error::RecoveryError;
use crate::executor::{Action, CommandLine, Executor, Outcome};

/// Enables kernel modesetting for the NVIDIA DRM module; Wayland sessions need it.
pub const MODESET_OPTIONS: &str = "options nvidia-drm modeset=1\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    Perform(Action),
    /// Nothing to do; the note says why.
    Skip(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub work: Work,
}

impl Step {
    fn perform(name: impl Into<String>, action: Action) -> Self {
        Self { name: name.into(), work: Work::Perform(action) }
    }

    fn skip(name: impl Into<String>, note: impl Into<String>) -> Self {
        Self { name: name.into(), work: Work::Skip(note.into()) }
    }
}

fn apt_install(packages: &[&str]) -> Action {
    let mut args = vec!["install", "-y"];
    args.extend_from_slice(packages);
    Action::Run(CommandLine::privileged("apt-get", args))
}

/// `monitors.xml` -> `monitors.xml.bak-20261018-142501`.
pub fn backup_path(file: &Path, stamp: &str) -> PathBuf {
    let mut name = file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".bak-{}", stamp));
    file.with_file_name(name)
}

/// Only a case-insensitive `y` means yes.
pub fn confirms_reboot(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}

fn reboot_answer_label(answer: &str) -> &str {
    match answer.trim() {
        "" => "(none)",
        answer => answer,
    }
}

/// Inputs gathered from the machine right before the mutation steps run.
pub struct Host {
    pub kernel_release: String,
    pub monitors_present: bool,
    pub stamp: String,
}

/// The ordered, non-reorderable mutation sequence.
pub fn mutation_steps(driver: &DriverChoice, settings: &Settings, host: &Host) -> Vec<Step> {
    let mut steps = Vec::new();

    // sudo caches credentials; prompt once up front.
    if settings.escalation == "sudo" {
        steps.push(Step::perform(
            "Refresh sudo credentials",
            Action::Run(CommandLine::new("sudo", ["-v"])),
        ));
    }

    steps.push(Step::perform(
        "Refresh package index",
        Action::Run(CommandLine::privileged("apt-get", ["update"])),
    ));

    let headers = format!("linux-headers-{}", host.kernel_release);
    steps.push(Step::perform(
        format!("CRITICAL: Install kernel headers for running kernel {}", host.kernel_release),
        apt_install(&[headers.as_str()]),
    ));

    steps.push(Step::perform(
        "Install DKMS and build tools",
        apt_install(&["dkms", "build-essential"]),
    ));

    steps.push(Step::perform(
        format!("Install driver {}", driver.name),
        apt_install(&[driver.name.as_str()]),
    ));

    let utils = driver.utils_package();
    steps.push(Step::perform(
        format!("Install utilities {}", utils),
        apt_install(&[utils.as_str()]),
    ));

    steps.push(Step::perform(
        "Enable DRM kernel modesetting",
        Action::InstallFile {
            contents: MODESET_OPTIONS.to_string(),
            dest: settings.modprobe_conf.clone(),
            mode: 0o644,
        },
    ));

    let monitors = &settings.monitors_file;
    if host.monitors_present {
        steps.push(Step::perform(
            "Reset monitor configuration",
            Action::Rename {
                from: monitors.clone(),
                to: backup_path(monitors, &host.stamp),
            },
        ));
    } else {
        steps.push(Step::skip(
            "Reset monitor configuration",
            format!("{} not found, nothing to reset", monitors.display()),
        ));
    }

    steps
}

fn kernel_release() -> Result<String> {
    let release = sys_info::os_release()
        .map_err(|e| anyhow!("Failed to read running kernel release: {:?}", e))?;
    let release = release.trim().to_string();
    if release.is_empty() {
        return Err(anyhow!("Running kernel release is empty"));
    }
    Ok(release)
}

pub struct Runner<'a> {
    config: RunConfig,
    settings: &'a Settings,
    console: &'a Console,
    session: &'a LogSession,
    exec: Executor<'a>,
}

impl<'a> Runner<'a> {
    pub fn new(
        config: RunConfig,
        settings: &'a Settings,
        console: &'a Console,
        session: &'a LogSession,
    ) -> Self {
        let exec = Executor::new(console, config.dry_run(), &settings.escalation);
        Self { config, settings, console, session, exec }
    }

    pub fn run(&self) -> Result<()> {
        self.console.header("🚀 GNOME + Wayland + NVIDIA recovery");
        self.console.detail(&format!("Started: {}", self.session.started.format("%Y-%m-%d %H:%M:%S")));
        self.console.detail(&format!("Mode: {}", self.config.mode_label()));
        self.console.detail(&format!("Log: {}", self.session.path.display()));

        self.console.header("🔍 Detecting GPU Hardware...");
        if !detect::probe_gpu(&self.exec)? {
            self.console.warn("⚠️  No NVIDIA GPU detected. Nothing to do.");
            return Ok(());
        }
        self.console.success("👉 NVIDIA GPU detected.");

        self.console.header("🔍 Looking up the recommended driver...");
        let driver = match detect::probe_driver(&self.exec) {
            Ok(driver) => driver,
            Err(err) => {
                if let Some(RecoveryError::NoRecommendedDriver { listing }) = err.downcast_ref::<RecoveryError>() {
                    self.dump_listing(listing);
                }
                return Err(err);
            }
        };
        self.console.success(&format!(
            "👉 Recommended: {} ({}, version {})",
            driver.name, driver.kind, driver.version
        ));

        if self.config.detect_only() {
            self.summary(&driver);
            self.console.success("✅ Detect-only run finished. No changes were made.");
            return Ok(());
        }

        let host = Host {
            kernel_release: kernel_release()?,
            monitors_present: self.settings.monitors_file.exists(),
            stamp: Local::now().format(STAMP_FORMAT).to_string(),
        };
        for step in mutation_steps(&driver, self.settings, &host) {
            self.run_step(&step)?;
        }

        self.summary(&driver);
        if self.config.dry_run() {
            self.console.success("✅ Dry run finished. No changes were made.");
            return Ok(());
        }
        self.offer_reboot()
    }

    fn run_step(&self, step: &Step) -> Result<()> {
        let section = self.console.begin_section(&step.name);
        let outcome = match &step.work {
            Work::Perform(action) => self.exec.perform(action)?,
            Work::Skip(note) => {
                self.console.detail(&format!("ℹ️  {}", note));
                Outcome::Success
            }
        };
        let result = section.finish(outcome)?;
        tracing::info!(
            section = %result.name,
            elapsed_s = result.elapsed_secs(),
            outcome = ?result.outcome,
            "section finished"
        );
        Ok(())
    }

    fn dump_listing(&self, listing: &str) {
        self.console.failure("❌ No recommended NVIDIA driver found.");
        self.console.info("--- ubuntu-drivers devices ---");
        for line in listing.lines() {
            self.console.info(line);
        }
        self.console.info("--- end ---");
    }

    fn summary(&self, driver: &DriverChoice) {
        self.console.header("📋 Summary");
        self.console.detail(&format!("Log file:  {}", self.session.path.display()));
        self.console.detail(&format!("Mode:      {}", self.config.mode_label()));
        self.console.detail(&format!("Driver:    {} ({}, version {})", driver.name, driver.kind, driver.version));
        self.console.detail(&format!("Utilities: {}", driver.utils_package()));
    }

    fn offer_reboot(&self) -> Result<()> {
        self.console.header("🔄 A reboot is required to load the new driver.");
        let answer = if io::stdin().is_terminal() {
            inquire::Text::new("Reboot now? [y/N]")
                .prompt()
                .unwrap_or_else(|e| {
                    self.console.warn(&format!("⚠️  No answer ({}), not rebooting.", e));
                    String::new()
                })
        } else {
            self.console.warn("⚠️  stdin is not a terminal, not rebooting.");
            String::new()
        };
        self.console.detail(&format!("Reboot answer: {}", reboot_answer_label(&answer)));

        if !confirms_reboot(&answer) {
            self.console.success("✅ Done. Reboot when convenient.");
            return Ok(());
        }
        self.run_step(&Step::perform(
            "Reboot",
            Action::Run(CommandLine::privileged("reboot", Vec::<String>::new())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DriverKind;

    fn settings(escalation: &str) -> Settings {
        Settings {
            escalation: escalation.to_string(),
            monitors_file: PathBuf::from("/home/tester/.config/monitors.xml"),
            modprobe_conf: PathBuf::from("/etc/modprobe.d/nvidia-drm-modeset.conf"),
            log_dir: PathBuf::from("/home/tester/.local/state/gnome-nvidia-recovery"),
        }
    }

    fn driver() -> DriverChoice {
        DriverChoice { name: "nvidia-driver-535-open".into(), kind: DriverKind::Open, version: 535 }
    }

    fn host(monitors_present: bool) -> Host {
        Host {
            kernel_release: "6.8.0-45-generic".into(),
            monitors_present,
            stamp: "20261018-142501".into(),
        }
    }

    fn rendered(steps: &[Step], escalation: &str) -> Vec<String> {
        let (console, _) = crate::console::testing::capture();
        let exec = Executor::new(&console, true, escalation);
        steps
            .iter()
            .map(|step| match &step.work {
                Work::Perform(action) => exec.render(action),
                Work::Skip(note) => format!("skip: {}", note),
            })
            .collect()
    }

    #[test]
    fn steps_run_in_the_fixed_order() {
        let steps = mutation_steps(&driver(), &settings("sudo"), &host(true));
        assert_eq!(
            rendered(&steps, "sudo"),
            vec![
                "sudo -v",
                "sudo apt-get update",
                "sudo apt-get install -y linux-headers-6.8.0-45-generic",
                "sudo apt-get install -y dkms build-essential",
                "sudo apt-get install -y nvidia-driver-535-open",
                "sudo apt-get install -y nvidia-utils-535",
                "sudo install -m 644 -o root -g root '<staged>' /etc/modprobe.d/nvidia-drm-modeset.conf",
                "mv /home/tester/.config/monitors.xml /home/tester/.config/monitors.xml.bak-20261018-142501",
            ]
        );
    }

    #[test]
    fn kernel_headers_step_is_flagged_critical() {
        let steps = mutation_steps(&driver(), &settings("sudo"), &host(true));
        assert!(steps[2].name.starts_with("CRITICAL"));
        assert!(steps[2].name.contains("6.8.0-45-generic"));
    }

    #[test]
    fn pkexec_skips_the_sudo_warmup() {
        let steps = mutation_steps(&driver(), &settings("pkexec"), &host(true));
        let lines = rendered(&steps, "pkexec");
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "pkexec apt-get update");
    }

    #[test]
    fn modeset_file_contents() {
        let steps = mutation_steps(&driver(), &settings("sudo"), &host(true));
        let modeset = steps.iter().find(|s| s.name == "Enable DRM kernel modesetting").unwrap();
        match &modeset.work {
            Work::Perform(Action::InstallFile { contents, mode, .. }) => {
                assert_eq!(contents, "options nvidia-drm modeset=1\n");
                assert_eq!(*mode, 0o644);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_monitors_file_is_a_noop() {
        let steps = mutation_steps(&driver(), &settings("sudo"), &host(false));
        let last = steps.last().unwrap();
        assert_eq!(last.name, "Reset monitor configuration");
        match &last.work {
            Work::Skip(note) => assert!(note.contains("monitors.xml not found")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn proprietary_driver_uses_its_own_utils() {
        let proprietary = DriverChoice {
            name: "nvidia-driver-470".into(),
            kind: DriverKind::Proprietary,
            version: 470,
        };
        let lines = rendered(&mutation_steps(&proprietary, &settings("sudo"), &host(false)), "sudo");
        assert!(lines.contains(&"sudo apt-get install -y nvidia-driver-470".to_string()));
        assert!(lines.contains(&"sudo apt-get install -y nvidia-utils-470".to_string()));
    }

    #[test]
    fn backup_name_appends_the_stamp() {
        assert_eq!(
            backup_path(Path::new("/home/a/.config/monitors.xml"), "20260101-000000"),
            PathBuf::from("/home/a/.config/monitors.xml.bak-20260101-000000")
        );
    }

    #[test]
    fn only_y_confirms_a_reboot() {
        for yes in ["y", "Y", " y\n"] {
            assert!(confirms_reboot(yes), "{yes:?}");
        }
        for no in ["", "n", "N", "yes", "yy", "no", "sure"] {
            assert!(!confirms_reboot(no), "{no:?}");
        }
    }

    #[test]
    fn reboot_answer_is_logged_without_repeating_the_prompt() {
        assert_eq!(reboot_answer_label(" y\n"), "y");
        assert_eq!(reboot_answer_label(""), "(none)");
    }

    #[test]
    fn skipped_step_finishes_successfully() {
        let (console, buf) = crate::console::testing::capture();
        let session = LogSession { path: PathBuf::from("/tmp/x.log"), started: Local::now() };
        let settings = settings("sudo");
        let runner = Runner::new(RunConfig::new(false, false), &settings, &console, &session);

        runner.run_step(&Step::skip("Reset monitor configuration", "nothing here")).unwrap();
        let log = buf.contents();
        assert!(log.contains("ℹ️  nothing here"));
        assert!(log.contains("✅ Reset monitor configuration (0s)"));
    }

    #[test]
    fn failing_step_stops_with_its_status() {
        let (console, _) = crate::console::testing::capture();
        let session = LogSession { path: PathBuf::from("/tmp/x.log"), started: Local::now() };
        let settings = settings("sudo");
        let runner = Runner::new(RunConfig::new(false, false), &settings, &console, &session);

        let step = Step::perform("Explode", Action::Run(CommandLine::new("sh", ["-c", "exit 42"])));
        let err = runner.run_step(&step).unwrap_err();
        match err.downcast_ref::<RecoveryError>() {
            Some(RecoveryError::StepFailed { step, code }) => {
                assert_eq!(step, "Explode");
                assert_eq!(*code, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
