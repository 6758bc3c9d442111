//! Human-readable reports produced by multi-step operations.

use crate::cipher::Cipher;
use crate::kdf::KdfParams;
use crate::status::SecurityStatus;
use crate::transport::{Drive, SelfTestOutcome};

/// Severity levels used when reporting events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLevel {
    Info,
    Success,
    Warn,
    Error,
    Security,
}

/// Single line of output produced by an operation step.
#[derive(Debug, Clone)]
pub struct ReportEvent {
    pub level: ReportLevel,
    pub message: String,
}

pub(crate) fn event(level: ReportLevel, message: impl Into<String>) -> ReportEvent {
    ReportEvent {
        level,
        message: message.into(),
    }
}

/// Result of the drive's built-in self-test plus what was observed on the way.
#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    pub drive: Drive,
    pub outcome: SelfTestOutcome,
    pub events: Vec<ReportEvent>,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.outcome == SelfTestOutcome::Passed
    }

    pub fn summary(&self) -> &'static str {
        match self.outcome {
            SelfTestOutcome::Passed => "Everything is okay.",
            SelfTestOutcome::HardwareError => "Hardware error!",
        }
    }
}

/// Identity, cipher and key-derivation parameters of a bound drive.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub drive: Drive,
    pub product: String,
    pub status: SecurityStatus,
    pub cipher: Cipher,
    pub supported_ciphers: Vec<Cipher>,
    /// `None` when the drive does not encrypt.
    pub blob_len: Option<usize>,
    pub kdf: KdfParams,
    /// Whether `kdf` came from the drive's security block or the defaults.
    pub kdf_stored: bool,
    pub hint: String,
}
