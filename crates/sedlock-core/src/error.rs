use crate::status::SecurityStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type SedResult<T> = Result<T, SedError>;

#[derive(Error, Debug)]
pub enum SedError {
    #[error("[SL1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[SL1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[SL1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[SL1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[SL1101] invalid argument: {0}")]
    InvalidArgument(String),

    #[error("[SL1200] device `{}` not found", .0.display())]
    DeviceNotFound(PathBuf),

    #[error("[SL1201] device `{}` is busy: {reason}", .path.display())]
    DeviceBusy { path: PathBuf, reason: String },

    #[error("[SL1202] no device is bound")]
    NoDeviceBound,

    #[error("[SL2000] transport error: {0}")]
    Transport(String),

    #[error("[SL2001] request cancelled: {0}")]
    Cancelled(String),

    #[error("[SL3000] password incorrect")]
    WrongPassword,

    #[error("[SL3001] unlock attempts exceeded; erase or power-cycle the device")]
    AttemptsExceeded,

    #[error("[SL3002] a user password is already configured")]
    AlreadyConfigured,

    #[error("[SL3003] password must not be empty")]
    EmptyPassword,

    #[error("[SL3004] device does not support encryption")]
    NotEncryptionCapable,

    #[error("[SL3100] cannot {operation} while device is {status}")]
    InvalidState {
        operation: &'static str,
        status: SecurityStatus,
    },

    #[error("[SL3200] erase did not complete ({reason}); device now reports {}", observed_label(.observed))]
    EraseInterrupted {
        reason: String,
        observed: Option<SecurityStatus>,
    },
}

fn observed_label(observed: &Option<SecurityStatus>) -> String {
    match observed {
        Some(status) => status.to_string(),
        None => "an unknown status".to_string(),
    }
}

/// What a caller should do next after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The same request may be submitted again.
    Retry,
    /// Credential and erase operations must no longer be offered.
    DisableCredentials,
    /// Nothing sensible to retry; surface the error.
    Abort,
}

impl SedError {
    pub fn code(&self) -> &'static str {
        match self {
            SedError::Io(_) => "SL1000",
            SedError::Toml(_) => "SL1001",
            SedError::Yaml(_) => "SL1002",
            SedError::InvalidConfig(_) => "SL1100",
            SedError::InvalidArgument(_) => "SL1101",
            SedError::DeviceNotFound(_) => "SL1200",
            SedError::DeviceBusy { .. } => "SL1201",
            SedError::NoDeviceBound => "SL1202",
            SedError::Transport(_) => "SL2000",
            SedError::Cancelled(_) => "SL2001",
            SedError::WrongPassword => "SL3000",
            SedError::AttemptsExceeded => "SL3001",
            SedError::AlreadyConfigured => "SL3002",
            SedError::EmptyPassword => "SL3003",
            SedError::NotEncryptionCapable => "SL3004",
            SedError::InvalidState { .. } => "SL3100",
            SedError::EraseInterrupted { .. } => "SL3200",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            SedError::WrongPassword
            | SedError::EmptyPassword
            | SedError::InvalidArgument(_)
            | SedError::DeviceBusy { .. }
            | SedError::Transport(_)
            | SedError::Cancelled(_) => Disposition::Retry,
            SedError::AttemptsExceeded | SedError::NotEncryptionCapable => {
                Disposition::DisableCredentials
            }
            _ => Disposition::Abort,
        }
    }

    /// Shorthand for mapping a mismatched response into a transport fault.
    pub(crate) fn unexpected(expected: &str, got: impl std::fmt::Debug) -> Self {
        SedError::Transport(format!("expected {expected} response, got {got:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_password_and_lockout_are_distinguishable() {
        assert_eq!(SedError::WrongPassword.disposition(), Disposition::Retry);
        assert_eq!(
            SedError::AttemptsExceeded.disposition(),
            Disposition::DisableCredentials
        );
        assert_ne!(
            SedError::WrongPassword.code(),
            SedError::AttemptsExceeded.code()
        );
    }

    #[test]
    fn invalid_state_message_names_status() {
        let err = SedError::InvalidState {
            operation: "unlock",
            status: SecurityStatus::NoUserPassword,
        };
        assert!(err.to_string().contains("unlock"));
        assert!(err.to_string().contains("NoUserPassword"));
        assert_eq!(err.disposition(), Disposition::Abort);
    }
}
