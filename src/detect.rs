//! GPU and driver detection.
//!
//! Everything here reads command output and decides; nothing mutates.
//! The two probes shell out through the executor's read-only `query`.

use std::fmt;
use std::sync::OnceLock;
use anyhow::Result;
use regex::Regex;

use crate::error::RecoveryError;
use crate::executor::Executor;

// Compile regular expressions once.
static DRIVER_RE: OnceLock<Regex> = OnceLock::new();
static VERSION_RE: OnceLock<Regex> = OnceLock::new();

/// Driver identifier as listed by `ubuntu-drivers`, e.g. `nvidia-driver-535-server-open`.
fn driver_re() -> &'static Regex {
    DRIVER_RE.get_or_init(|| Regex::new(r"\bnvidia-driver-\d+(?:-[a-z]+)*").unwrap())
}

fn version_re() -> &'static Regex {
    VERSION_RE.get_or_init(|| Regex::new(r"nvidia-driver-(\d+)").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Open,
    Proprietary,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Open => write!(f, "open"),
            DriverKind::Proprietary => write!(f, "proprietary"),
        }
    }
}

/// The driver the rest of the run installs. Built once, never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverChoice {
    pub name: String,
    pub kind: DriverKind,
    pub version: u32,
}

impl DriverChoice {
    /// Utilities package matching the driver branch, e.g. `nvidia-utils-535`.
    pub fn utils_package(&self) -> String {
        format!("nvidia-utils-{}", self.version)
    }
}

/// True if any PCI device in `lspci -nn` output is an NVIDIA part.
/// Matches the vendor name or the numeric vendor id `10de`.
pub fn has_nvidia_gpu(lspci: &str) -> bool {
    lspci.lines().any(|line| {
        let line = line.to_lowercase();
        line.contains("nvidia") || line.contains("[10de:")
    })
}

/// Digits after `nvidia-driver-`.
pub fn parse_version(identifier: &str) -> Option<u32> {
    version_re()
        .captures(identifier)
        .and_then(|caps| caps[1].parse().ok())
}

fn choice_from_line(line: &str, kind: DriverKind) -> Option<DriverChoice> {
    let name = driver_re().find(line)?.as_str().to_string();
    let version = parse_version(&name)?;
    Some(DriverChoice { name, kind, version })
}

/// Picks the recommended driver from `ubuntu-drivers devices` output.
///
/// First pass: the first line tagged `nvidia-driver`, `open` and `recommended`.
/// Second pass, only when the first finds nothing: the first line tagged
/// `nvidia-driver` and `recommended`, taken as the proprietary driver.
/// The first matching line decides; if it has no `nvidia-driver-<digits>`
/// identifier, nothing is recommended and later lines are not consulted.
pub fn recommend_driver(listing: &str) -> Option<DriverChoice> {
    let recommended = || {
        listing
            .lines()
            .filter(|line| line.contains("nvidia-driver") && line.contains("recommended"))
    };

    match recommended().find(|line| line.contains("open")) {
        Some(line) => choice_from_line(line, DriverKind::Open),
        None => recommended()
            .next()
            .and_then(|line| choice_from_line(line, DriverKind::Proprietary)),
    }
}

// --- Probes ---

pub fn probe_gpu(exec: &Executor) -> Result<bool> {
    let lspci = exec.query("lspci", &["-nn"])?;
    Ok(has_nvidia_gpu(&lspci))
}

/// Queries `ubuntu-drivers devices`; a listing without a recommendation is a
/// detection failure that carries the raw text for diagnosis.
pub fn probe_driver(exec: &Executor) -> Result<DriverChoice> {
    let listing = exec.query("ubuntu-drivers", &["devices"])?;
    match recommend_driver(&listing) {
        Some(choice) => Ok(choice),
        None => Err(RecoveryError::NoRecommendedDriver { listing }.into()),
    }
}
