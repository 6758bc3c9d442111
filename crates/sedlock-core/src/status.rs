//! Security state machine: derives the drive's authentication state from the
//! facts it reports and decides which operations each state admits.

use crate::error::{SedError, SedResult};
use crate::transport::EncryptionReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authentication state of the bound drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityStatus {
    NoUserPassword,
    Locked,
    Unlocked,
    UnlockAttemptExceeded,
    NoEncryption,
}

impl fmt::Display for SecurityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SecurityStatus::NoUserPassword => "NoUserPassword",
            SecurityStatus::Locked => "Locked",
            SecurityStatus::Unlocked => "Unlocked",
            SecurityStatus::UnlockAttemptExceeded => "UnlockAttemptExceeded",
            SecurityStatus::NoEncryption => "NoEncryption",
        };
        f.write_str(label)
    }
}

/// Raw security code reported by the drive firmware.
pub(crate) mod code {
    pub const NO_USER_PASSWORD: u8 = 0;
    pub const LOCKED: u8 = 1;
    pub const UNLOCKED: u8 = 2;
    pub const ATTEMPTS_EXCEEDED: u8 = 6;
    pub const NO_ENCRYPTION: u8 = 7;
}

/// The independent facts a status is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityFacts {
    pub encryption_capable: bool,
    pub password_configured: bool,
    pub locked: bool,
    pub hardware_lockout: bool,
}

impl SecurityFacts {
    /// Interpret an encryption status report.
    pub fn from_report(report: &EncryptionReport) -> SedResult<Self> {
        let facts = match report.security_code {
            code::NO_USER_PASSWORD => Self::configured(false, false),
            code::LOCKED => Self::configured(true, true),
            code::UNLOCKED => Self::configured(true, false),
            code::ATTEMPTS_EXCEEDED => Self {
                hardware_lockout: true,
                ..Self::configured(true, true)
            },
            code::NO_ENCRYPTION => Self {
                encryption_capable: false,
                password_configured: false,
                locked: false,
                hardware_lockout: false,
            },
            other => {
                return Err(SedError::Transport(format!(
                    "unknown security code {other:#04x}; unsupported device"
                )))
            }
        };

        if !report.cipher.is_encrypting() && facts.encryption_capable {
            return Ok(Self {
                encryption_capable: false,
                ..facts
            });
        }
        Ok(facts)
    }

    fn configured(password_configured: bool, locked: bool) -> Self {
        Self {
            encryption_capable: true,
            password_configured,
            locked,
            hardware_lockout: false,
        }
    }
}

impl SecurityStatus {
    /// Compute the state from device facts and the session's attempt shadow.
    pub fn derive(facts: SecurityFacts, attempts: &AttemptTracker) -> Self {
        if !facts.encryption_capable {
            SecurityStatus::NoEncryption
        } else if !facts.password_configured {
            SecurityStatus::NoUserPassword
        } else if facts.locked {
            if facts.hardware_lockout || attempts.exhausted() {
                SecurityStatus::UnlockAttemptExceeded
            } else {
                SecurityStatus::Locked
            }
        } else {
            SecurityStatus::Unlocked
        }
    }

    /// Reject `operation` unless the current state admits it.
    pub fn require(self, operation: Operation) -> SedResult<()> {
        use SecurityStatus::*;

        if self == NoEncryption && operation.needs_encryption() {
            return Err(SedError::NotEncryptionCapable);
        }

        let allowed = match operation {
            Operation::SetPassword => {
                if self != NoUserPassword {
                    return Err(SedError::AlreadyConfigured);
                }
                true
            }
            Operation::Unlock => {
                if self == UnlockAttemptExceeded {
                    return Err(SedError::AttemptsExceeded);
                }
                self == Locked
            }
            Operation::RemovePassword | Operation::ChangePassword => {
                if self == UnlockAttemptExceeded {
                    return Err(SedError::AttemptsExceeded);
                }
                self == Unlocked
            }
            Operation::Erase => true,
            Operation::WriteToggle => !matches!(self, Locked | UnlockAttemptExceeded),
        };

        if allowed {
            Ok(())
        } else {
            Err(SedError::InvalidState {
                operation: operation.label(),
                status: self,
            })
        }
    }

    /// State the drive should report after a successful operation.
    pub fn after(self, operation: Operation, post_setup: PostSetupState) -> Self {
        match operation {
            Operation::SetPassword => match post_setup {
                PostSetupState::Unlocked => SecurityStatus::Unlocked,
                PostSetupState::Locked => SecurityStatus::Locked,
            },
            Operation::Unlock | Operation::ChangePassword => SecurityStatus::Unlocked,
            Operation::RemovePassword | Operation::Erase => SecurityStatus::NoUserPassword,
            Operation::WriteToggle => self,
        }
    }
}

/// Operations guarded by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SetPassword,
    Unlock,
    RemovePassword,
    ChangePassword,
    Erase,
    WriteToggle,
}

impl Operation {
    pub fn label(self) -> &'static str {
        match self {
            Operation::SetPassword => "set a password",
            Operation::Unlock => "unlock",
            Operation::RemovePassword => "remove the password",
            Operation::ChangePassword => "change the password",
            Operation::Erase => "erase",
            Operation::WriteToggle => "change device settings",
        }
    }

    fn needs_encryption(self) -> bool {
        !matches!(self, Operation::WriteToggle)
    }
}

/// Where the firmware leaves a drive right after the first password is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PostSetupState {
    #[default]
    Unlocked,
    Locked,
}

/// Session shadow of the drive's failed-unlock counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTracker {
    failures: u32,
    limit: u32,
}

impl AttemptTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            failures: 0,
            limit: limit.max(1),
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.failures)
    }

    pub fn exhausted(&self) -> bool {
        self.failures >= self.limit
    }

    /// Count one failed unlock; returns true once the limit is reached.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1).min(self.limit);
        self.exhausted()
    }

    /// The drive reported its own lockout.
    pub fn mark_exhausted(&mut self) {
        self.failures = self.limit;
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
