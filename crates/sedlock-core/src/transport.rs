//! Seam between the controller and the physical drive.
//!
//! A [`DriveTransport`] enumerates candidate drives and opens exclusive
//! handles; a [`DeviceHandle`] executes vendor requests one at a time. How a
//! request is encoded on the wire is entirely the transport's business, so the
//! controller can be exercised against the in-memory simulator or an external
//! helper process without change.

use crate::cipher::Cipher;
use crate::error::{SedError, SedResult};
use crate::status::PostSetupState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// An attachable drive as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub path: PathBuf,
    pub name: String,
}

/// Firmware-defined constants the controller must not guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub unlock_attempt_limit: u32,
    pub post_setup_state: PostSetupState,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            unlock_attempt_limit: 5,
            post_setup_state: PostSetupState::Unlocked,
        }
    }
}

/// Encryption status as reported by the drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionReport {
    pub security_code: u8,
    pub cipher: Cipher,
    pub supported_ciphers: Vec<Cipher>,
    pub password_blob_len: u16,
    pub key_reset_enabler: u32,
}

impl EncryptionReport {
    /// Password blob length for the current cipher, cross-checked against
    /// what the drive advertises. Zero means the drive left it unstated.
    pub fn blob_len(&self) -> SedResult<usize> {
        let expected = self.cipher.password_blob_len()?;
        let advertised = usize::from(self.password_blob_len);
        if advertised != 0 && advertised != expected {
            return Err(SedError::Transport(format!(
                "drive advertises {advertised}-byte password blobs for {}, expected {expected}",
                self.cipher
            )));
        }
        Ok(expected)
    }
}

/// Outcome of the drive's built-in self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfTestOutcome {
    Passed,
    HardwareError,
}

/// Vendor command issued to a bound drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceRequest {
    EncryptionStatus,
    Unlock {
        #[serde(with = "hex_bytes")]
        blob: Vec<u8>,
    },
    ChangePassphrase {
        cipher: Cipher,
        #[serde(default, with = "hex_opt")]
        new_blob: Option<Vec<u8>>,
        #[serde(default, with = "hex_opt")]
        old_blob: Option<Vec<u8>>,
    },
    ResetDataKey {
        cipher: Cipher,
        key_reset_enabler: u32,
    },
    ReadHandyStore {
        index: u32,
    },
    WriteHandyStore {
        index: u32,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    ReadSleepTimer,
    WriteSleepTimer {
        seconds: u32,
    },
    ReadLedBrightness,
    WriteLedBrightness {
        level: u8,
    },
    ReadVirtualCd,
    WriteVirtualCd {
        enabled: bool,
    },
    SendDiagnostic,
    ProductIdentification,
    DiscardAll,
}

impl DeviceRequest {
    /// Short name used for logging and fault injection; never includes secrets.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceRequest::EncryptionStatus => "encryption_status",
            DeviceRequest::Unlock { .. } => "unlock",
            DeviceRequest::ChangePassphrase { .. } => "change_passphrase",
            DeviceRequest::ResetDataKey { .. } => "reset_data_key",
            DeviceRequest::ReadHandyStore { .. } => "read_handy_store",
            DeviceRequest::WriteHandyStore { .. } => "write_handy_store",
            DeviceRequest::ReadSleepTimer => "read_sleep_timer",
            DeviceRequest::WriteSleepTimer { .. } => "write_sleep_timer",
            DeviceRequest::ReadLedBrightness => "read_led_brightness",
            DeviceRequest::WriteLedBrightness { .. } => "write_led_brightness",
            DeviceRequest::ReadVirtualCd => "read_virtual_cd",
            DeviceRequest::WriteVirtualCd { .. } => "write_virtual_cd",
            DeviceRequest::SendDiagnostic => "send_diagnostic",
            DeviceRequest::ProductIdentification => "product_identification",
            DeviceRequest::DiscardAll => "discard_all",
        }
    }
}

/// Reply to a [`DeviceRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum DeviceResponse {
    Done,
    EncryptionStatus(EncryptionReport),
    Block {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    SleepTimer {
        seconds: u32,
    },
    Brightness {
        level: u8,
    },
    Switch {
        enabled: bool,
    },
    SelfTest {
        outcome: SelfTestOutcome,
    },
    Product {
        name: String,
    },
}

impl DeviceResponse {
    pub fn done(self) -> SedResult<()> {
        match self {
            DeviceResponse::Done => Ok(()),
            other => Err(SedError::unexpected("done", other)),
        }
    }

    pub fn into_report(self) -> SedResult<EncryptionReport> {
        match self {
            DeviceResponse::EncryptionStatus(report) => Ok(report),
            other => Err(SedError::unexpected("encryption status", other)),
        }
    }

    pub fn into_block(self) -> SedResult<Vec<u8>> {
        match self {
            DeviceResponse::Block { data } => Ok(data),
            other => Err(SedError::unexpected("block", other)),
        }
    }

    pub fn into_seconds(self) -> SedResult<u32> {
        match self {
            DeviceResponse::SleepTimer { seconds } => Ok(seconds),
            other => Err(SedError::unexpected("sleep timer", other)),
        }
    }

    pub fn into_brightness(self) -> SedResult<u8> {
        match self {
            DeviceResponse::Brightness { level } => Ok(level),
            other => Err(SedError::unexpected("brightness", other)),
        }
    }

    pub fn into_switch(self) -> SedResult<bool> {
        match self {
            DeviceResponse::Switch { enabled } => Ok(enabled),
            other => Err(SedError::unexpected("switch", other)),
        }
    }

    pub fn into_self_test(self) -> SedResult<SelfTestOutcome> {
        match self {
            DeviceResponse::SelfTest { outcome } => Ok(outcome),
            other => Err(SedError::unexpected("self-test", other)),
        }
    }

    pub fn into_product(self) -> SedResult<String> {
        match self {
            DeviceResponse::Product { name } => Ok(name),
            other => Err(SedError::unexpected("product", other)),
        }
    }
}

/// Abstraction over drive discovery and exclusive opening.
///
/// Implementations are expected to provide a thin, testable surface over the
/// underlying system interface (sysfs, helper binaries, etc.), so the state
/// machine can be exercised without real hardware attached.
pub trait DriveTransport {
    type Handle: DeviceHandle;

    /// List attachable drives in a stable order. No drives is not an error.
    fn enumerate(&self) -> SedResult<Vec<Drive>>;

    /// Open `path` exclusively. Dropping the handle releases the drive.
    fn open(&self, path: &Path) -> SedResult<Self::Handle>;
}

/// An open, exclusively held drive.
pub trait DeviceHandle {
    /// Identifier the handle was opened with.
    fn path(&self) -> &Path;

    /// Firmware constants for this drive.
    fn profile(&self) -> DeviceProfile;

    /// Execute one vendor request and wait for the drive's reply.
    ///
    /// Authentication failures reported by the drive must surface as
    /// [`SedError::WrongPassword`] / [`SedError::AttemptsExceeded`]; a request
    /// the drive refuses in its current state as [`SedError::InvalidState`]
    /// or [`SedError::Transport`].
    fn execute(&mut self, request: &DeviceRequest) -> SedResult<DeviceResponse>;
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|t| hex::decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}
