//! In-memory drive simulator implementing [`DriveTransport`].
//!
//! Behaves like a self-encrypting drive closely enough to exercise the
//! controller end to end: password blobs, lockout counting, a handy store,
//! settings registers and key reset. Faults can be injected per request kind.

use crate::cipher::Cipher;
use crate::error::{SedError, SedResult};
use crate::metadata::HANDY_STORE_BLOCK_SIZE;
use crate::status::{code, PostSetupState, SecurityStatus};
use crate::transport::{
    DeviceHandle, DeviceProfile, DeviceRequest, DeviceResponse, Drive, DriveTransport,
    EncryptionReport, SelfTestOutcome,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Injected failure for one request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail before the drive looks at the request.
    Fail,
    /// Verify credentials, then fail without committing anything.
    AfterVerify,
}

/// Blueprint and live state of one simulated drive.
#[derive(Debug, Clone)]
pub struct SimDrive {
    path: PathBuf,
    name: String,
    product: String,
    profile: DeviceProfile,
    encryption_capable: bool,
    cipher: Cipher,
    supported: Vec<Cipher>,
    key: Option<Vec<u8>>,
    locked: bool,
    failures: u32,
    key_reset_enabler: u32,
    handy_store: HashMap<u32, Vec<u8>>,
    sleep_seconds: u32,
    led: u8,
    virtual_cd: bool,
    self_test: SelfTestOutcome,
    open: bool,
    faults: HashMap<&'static str, Fault>,
    requests: HashMap<&'static str, u32>,
}

impl SimDrive {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            product: "My Passport 25E2".to_string(),
            profile: DeviceProfile::default(),
            encryption_capable: true,
            cipher: Cipher::Aes256Xts,
            supported: vec![Cipher::Aes128Xts, Cipher::Aes256Xts],
            key: None,
            locked: false,
            failures: 0,
            key_reset_enabler: 0x5eed_0001,
            handy_store: HashMap::new(),
            sleep_seconds: 1800,
            led: 255,
            virtual_cd: true,
            self_test: SelfTestOutcome::Passed,
            open: false,
            faults: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    pub fn attempt_limit(mut self, limit: u32) -> Self {
        self.profile.unlock_attempt_limit = limit.max(1);
        self
    }

    pub fn post_setup(mut self, state: PostSetupState) -> Self {
        self.profile.post_setup_state = state;
        self
    }

    pub fn without_encryption(mut self) -> Self {
        self.encryption_capable = false;
        self.cipher = Cipher::NoEncryption;
        self.supported = vec![Cipher::NoEncryption];
        self
    }

    pub fn failing_self_test(mut self) -> Self {
        self.self_test = SelfTestOutcome::HardwareError;
        self
    }

    fn lockout(&self) -> bool {
        self.failures >= self.profile.unlock_attempt_limit
    }

    fn security_code(&self) -> u8 {
        if !self.encryption_capable {
            code::NO_ENCRYPTION
        } else if self.key.is_none() {
            code::NO_USER_PASSWORD
        } else if self.locked && self.lockout() {
            code::ATTEMPTS_EXCEEDED
        } else if self.locked {
            code::LOCKED
        } else {
            code::UNLOCKED
        }
    }

    fn status(&self) -> SecurityStatus {
        match self.security_code() {
            code::NO_ENCRYPTION => SecurityStatus::NoEncryption,
            code::NO_USER_PASSWORD => SecurityStatus::NoUserPassword,
            code::ATTEMPTS_EXCEEDED => SecurityStatus::UnlockAttemptExceeded,
            code::LOCKED => SecurityStatus::Locked,
            _ => SecurityStatus::Unlocked,
        }
    }

    fn refuse(&self, operation: &'static str) -> SedError {
        SedError::InvalidState {
            operation,
            status: self.status(),
        }
    }

    fn check_blob(&self, cipher: Cipher, blob: &[u8]) -> SedResult<()> {
        if blob.len() != cipher.password_blob_len()? {
            return Err(SedError::Transport(format!(
                "password blob of {} bytes does not match {cipher}",
                blob.len()
            )));
        }
        Ok(())
    }

    fn handle(&mut self, request: &DeviceRequest) -> SedResult<DeviceResponse> {
        let kind = request.kind();
        *self.requests.entry(kind).or_insert(0) += 1;
        let fault = self.faults.get(kind).copied();
        if fault == Some(Fault::Fail) {
            return Err(SedError::Transport(format!("injected {kind} failure")));
        }
        let commit = fault.is_none();

        match request {
            DeviceRequest::EncryptionStatus => Ok(DeviceResponse::EncryptionStatus(EncryptionReport {
                security_code: self.security_code(),
                cipher: self.cipher,
                supported_ciphers: self.supported.clone(),
                password_blob_len: self.cipher.password_blob_len().unwrap_or(0) as u16,
                key_reset_enabler: self.key_reset_enabler,
            })),
            DeviceRequest::Unlock { blob } => {
                if !self.encryption_capable {
                    return Err(SedError::NotEncryptionCapable);
                }
                if self.key.is_none() || !self.locked {
                    return Err(self.refuse("unlock"));
                }
                if self.lockout() {
                    return Err(SedError::AttemptsExceeded);
                }
                if self.key.as_deref() != Some(blob.as_slice()) {
                    self.failures += 1;
                    return Err(SedError::WrongPassword);
                }
                if !commit {
                    return Err(SedError::Transport("injected unlock failure".into()));
                }
                self.locked = false;
                self.failures = 0;
                Ok(DeviceResponse::Done)
            }
            DeviceRequest::ChangePassphrase {
                cipher,
                new_blob,
                old_blob,
            } => {
                if !self.encryption_capable {
                    return Err(SedError::NotEncryptionCapable);
                }
                if self.key.is_some() {
                    if self.locked {
                        return Err(if self.lockout() {
                            SedError::AttemptsExceeded
                        } else {
                            self.refuse("change the passphrase")
                        });
                    }
                    if self.key != *old_blob {
                        return Err(SedError::WrongPassword);
                    }
                }
                if let Some(blob) = new_blob {
                    self.check_blob(*cipher, blob)?;
                }
                if !commit {
                    return Err(SedError::Transport(
                        "injected change_passphrase failure".into(),
                    ));
                }
                let first_password = self.key.is_none();
                self.key = new_blob.clone();
                self.locked = self.key.is_some()
                    && first_password
                    && self.profile.post_setup_state == PostSetupState::Locked;
                self.failures = 0;
                Ok(DeviceResponse::Done)
            }
            DeviceRequest::ResetDataKey {
                cipher,
                key_reset_enabler,
            } => {
                if !self.encryption_capable {
                    return Err(SedError::NotEncryptionCapable);
                }
                if *key_reset_enabler != self.key_reset_enabler {
                    return Err(SedError::Transport("stale key reset enabler".into()));
                }
                if !self.supported.contains(cipher) {
                    return Err(SedError::Transport(format!("cipher {cipher} unsupported")));
                }
                if !commit {
                    return Err(SedError::Transport("injected reset_data_key failure".into()));
                }
                self.key = None;
                self.locked = false;
                self.failures = 0;
                self.cipher = *cipher;
                self.key_reset_enabler = self
                    .key_reset_enabler
                    .wrapping_mul(1_103_515_245)
                    .wrapping_add(12_345);
                Ok(DeviceResponse::Done)
            }
            DeviceRequest::ReadHandyStore { index } => Ok(DeviceResponse::Block {
                data: self
                    .handy_store
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| vec![0; HANDY_STORE_BLOCK_SIZE]),
            }),
            DeviceRequest::WriteHandyStore { index, data } => {
                if data.len() != HANDY_STORE_BLOCK_SIZE {
                    return Err(SedError::Transport(format!(
                        "handy store block must be {HANDY_STORE_BLOCK_SIZE} bytes"
                    )));
                }
                if commit {
                    self.handy_store.insert(*index, data.clone());
                }
                Ok(DeviceResponse::Done)
            }
            DeviceRequest::ReadSleepTimer => Ok(DeviceResponse::SleepTimer {
                seconds: self.sleep_seconds,
            }),
            DeviceRequest::WriteSleepTimer { seconds } => {
                self.sleep_seconds = if *seconds == 0 {
                    0
                } else {
                    (*seconds).clamp(60, 28_800)
                };
                Ok(DeviceResponse::Done)
            }
            DeviceRequest::ReadLedBrightness => Ok(DeviceResponse::Brightness { level: self.led }),
            DeviceRequest::WriteLedBrightness { level } => {
                self.led = *level;
                Ok(DeviceResponse::Done)
            }
            DeviceRequest::ReadVirtualCd => Ok(DeviceResponse::Switch {
                enabled: self.virtual_cd,
            }),
            DeviceRequest::WriteVirtualCd { enabled } => {
                self.virtual_cd = *enabled;
                Ok(DeviceResponse::Done)
            }
            DeviceRequest::SendDiagnostic => Ok(DeviceResponse::SelfTest {
                outcome: self.self_test,
            }),
            DeviceRequest::ProductIdentification => Ok(DeviceResponse::Product {
                name: self.product.clone(),
            }),
            DeviceRequest::DiscardAll => Ok(DeviceResponse::Done),
        }
    }
}

#[derive(Debug, Default)]
struct SimBus {
    drives: BTreeMap<PathBuf, SimDrive>,
}

/// Shared handle to a set of simulated drives.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    bus: Arc<Mutex<SimBus>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drive(self, drive: SimDrive) -> Self {
        self.bus().drives.insert(drive.path.clone(), drive);
        self
    }

    fn bus(&self) -> MutexGuard<'_, SimBus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with<R>(&self, path: impl AsRef<Path>, f: impl FnOnce(&mut SimDrive) -> R) -> Option<R> {
        self.bus().drives.get_mut(path.as_ref()).map(f)
    }

    /// Unplug the drive.
    pub fn detach(&self, path: impl AsRef<Path>) {
        self.bus().drives.remove(path.as_ref());
    }

    /// Power-cycle: a drive with a password comes back locked with a fresh counter.
    pub fn power_cycle(&self, path: impl AsRef<Path>) {
        self.with(path, |drive| {
            drive.locked = drive.key.is_some();
            drive.failures = 0;
        });
    }

    pub fn inject_fault(&self, path: impl AsRef<Path>, kind: &'static str, fault: Fault) {
        self.with(path, |drive| {
            drive.faults.insert(kind, fault);
        });
    }

    pub fn clear_faults(&self, path: impl AsRef<Path>) {
        self.with(path, |drive| drive.faults.clear());
    }

    /// Number of requests of `kind` the drive has received.
    pub fn request_count(&self, path: impl AsRef<Path>, kind: &str) -> u32 {
        self.with(path, |drive| drive.requests.get(kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_open(&self, path: impl AsRef<Path>) -> bool {
        self.with(path, |drive| drive.open).unwrap_or(false)
    }
}

impl DriveTransport for SimulatedTransport {
    type Handle = SimHandle;

    fn enumerate(&self) -> SedResult<Vec<Drive>> {
        Ok(self
            .bus()
            .drives
            .values()
            .map(|drive| Drive {
                path: drive.path.clone(),
                name: drive.name.clone(),
            })
            .collect())
    }

    fn open(&self, path: &Path) -> SedResult<SimHandle> {
        let mut bus = self.bus();
        let drive = bus
            .drives
            .get_mut(path)
            .ok_or_else(|| SedError::DeviceNotFound(path.to_path_buf()))?;
        if drive.open {
            return Err(SedError::DeviceBusy {
                path: path.to_path_buf(),
                reason: "already opened by another session".into(),
            });
        }
        drive.open = true;
        Ok(SimHandle {
            path: path.to_path_buf(),
            profile: drive.profile,
            bus: Arc::clone(&self.bus),
        })
    }
}

/// Exclusive handle onto a simulated drive; released on drop.
#[derive(Debug)]
pub struct SimHandle {
    path: PathBuf,
    profile: DeviceProfile,
    bus: Arc<Mutex<SimBus>>,
}

impl DeviceHandle for SimHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn profile(&self) -> DeviceProfile {
        self.profile
    }

    fn execute(&mut self, request: &DeviceRequest) -> SedResult<DeviceResponse> {
        let mut bus = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        match bus.drives.get_mut(&self.path) {
            Some(drive) => drive.handle(request),
            None => Err(SedError::Transport(format!(
                "{} was detached",
                self.path.display()
            ))),
        }
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        let mut bus = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(drive) = bus.drives.get_mut(&self.path) {
            drive.open = false;
        }
    }
}
