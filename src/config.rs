//! Settings for the recovery run.
//!
//! Shares `~/.config/rust-dotfiles/config.toml` with the rest of the dotfiles
//! tooling; only the optional `[nvidia_recovery]` table is read here.

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::Deserialize;

const APP_DIR: &str = "gnome-nvidia-recovery";
const DEFAULT_ESCALATION: &str = "sudo";
const DEFAULT_MONITORS_FILE: &str = "~/.config/monitors.xml";
const DEFAULT_MODPROBE_CONF: &str = "/etc/modprobe.d/nvidia-drm-modeset.conf";

/// Expands shell-style paths like `~/` against the given home directory.
pub fn expand_path(path: &str, home: &Path) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(stripped) => home.join(stripped),
        None => PathBuf::from(path),
    }
}

// --- Config Models ---

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct RecoveryConfig {
    escalation: Option<String>,   // Program used for root-level steps (sudo / pkexec)
    monitors_file: Option<String>,
    modprobe_conf: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct GlobalConfig {
    #[serde(default)]
    nvidia_recovery: RecoveryConfig,
}

/// Fully resolved settings, built once at startup and passed around by reference.
#[derive(Debug, Clone)]
pub struct Settings {
    pub escalation: String,
    pub monitors_file: PathBuf,
    pub modprobe_conf: PathBuf,
    pub log_dir: PathBuf,
}

impl Settings {
    /// Reads the shared config file (if any) and the environment.
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("Cannot find home dir")?;
        let config_path = home.join(".config/rust-dotfiles/config.toml");
        let global = load_config(&config_path)?;
        let state_home = std::env::var_os("XDG_STATE_HOME").map(PathBuf::from);
        Ok(Self::resolve(global.nvidia_recovery, &home, state_home.as_deref()))
    }

    fn resolve(config: RecoveryConfig, home: &Path, state_home: Option<&Path>) -> Self {
        let escalation = config
            .escalation
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ESCALATION.to_string());
        let monitors_file = config.monitors_file.as_deref().unwrap_or(DEFAULT_MONITORS_FILE);
        let modprobe_conf = config.modprobe_conf.as_deref().unwrap_or(DEFAULT_MODPROBE_CONF);

        Self {
            escalation,
            monitors_file: expand_path(monitors_file, home),
            modprobe_conf: expand_path(modprobe_conf, home),
            log_dir: log_dir(home, state_home),
        }
    }
}

/// `$XDG_STATE_HOME/<app>` when set, `~/.local/state/<app>` otherwise.
fn log_dir(home: &Path, state_home: Option<&Path>) -> PathBuf {
    match state_home {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(APP_DIR),
        _ => home.join(".local/state").join(APP_DIR),
    }
}

/// A missing file is fine; a broken one is not.
fn load_config(path: &Path) -> Result<GlobalConfig> {
    if !path.exists() {
        return Ok(GlobalConfig::default());
    }
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let config: GlobalConfig = toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(config)
}
