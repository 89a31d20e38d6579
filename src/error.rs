use std::process::ExitCode;
use thiserror::Error;

/// Failures that decide the process exit status.
///
/// Anything else travels as a plain `anyhow::Error` and exits with 1.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("unrecognized argument: {token}")]
    Usage { token: String },

    #[error("no recommended NVIDIA driver found in `ubuntu-drivers devices` output")]
    NoRecommendedDriver { listing: String },

    #[error("step '{step}' failed with exit status {code}")]
    StepFailed { step: String, code: i32 },
}

impl RecoveryError {
    pub fn exit_status(&self) -> u8 {
        match self {
            RecoveryError::Usage { .. } | RecoveryError::NoRecommendedDriver { .. } => 1,
            RecoveryError::StepFailed { code, .. } => clamp_status(*code),
        }
    }
}

/// Squeezes a child status into the 1..=255 range a failing process may report.
fn clamp_status(code: i32) -> u8 {
    match u8::try_from(code) {
        Ok(0) | Err(_) => 1,
        Ok(code) => code,
    }
}

/// Maps any error bubbling out of the runner to the status `main` returns.
pub fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    ExitCode::from(exit_status_for(err))
}

fn exit_status_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<RecoveryError>()
        .map(RecoveryError::exit_status)
        .unwrap_or(1)
}
