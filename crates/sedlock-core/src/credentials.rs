//! Credential lifecycle for the bound drive: set, unlock, change and remove the
//! user password, and read back the stored hint.

use crate::cipher::Cipher;
use crate::error::{SedError, SedResult};
use crate::kdf::{derive_blob, KdfOverride, KdfParams};
use crate::metadata::{validate_hint, SecurityBlock, SECURITY_BLOCK_INDEX};
use crate::session::DeviceSession;
use crate::status::{Operation, SecurityStatus};
use crate::transport::{DeviceHandle, DeviceRequest, DeviceResponse};
use log::{error, info, warn};
use zeroize::Zeroizing;

/// Salt and iteration overrides for the password being presented (`current`)
/// and the one being installed (`new`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialOverrides {
    pub current: KdfOverride,
    pub new: KdfOverride,
}

/// Password operations against one bound drive.
pub struct CredentialService<'a, H: DeviceHandle> {
    session: &'a mut DeviceSession<H>,
    defaults: KdfParams,
    overrides: CredentialOverrides,
}

impl<'a, H: DeviceHandle> CredentialService<'a, H> {
    /// `defaults` is used when the drive carries no valid security block.
    pub fn new(session: &'a mut DeviceSession<H>, defaults: KdfParams) -> Self {
        Self {
            session,
            defaults,
            overrides: CredentialOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: CredentialOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Stored password hint; empty when none was ever written.
    pub fn hint(&mut self) -> SedResult<String> {
        Ok(self
            .security_block()?
            .map(|block| block.hint)
            .unwrap_or_default())
    }

    /// Configure the first user password on a drive that has none.
    ///
    /// The security block goes down before the credential: a drive with a
    /// hint but no password is still usable, while a keyed drive without
    /// its salt is not.
    pub fn set_password(&mut self, password: &str, hint: &str) -> SedResult<SecurityStatus> {
        let (status, report) = self.session.snapshot()?;
        status.require(Operation::SetPassword)?;
        if password.is_empty() {
            return Err(SedError::EmptyPassword);
        }
        validate_hint(hint)?;

        let previous = self.read_raw_block()?;
        let kdf = self.overrides.new.apply(self.stored_or_default(&previous));
        let new_blob = derive_blob(report.blob_len()?, &kdf, password)?;
        let block = SecurityBlock::new(kdf, hint)?;
        self.write_block(block.encode()?)
            .map_err(|err| SedError::Transport(format!("security metadata write failed: {err}")))?;

        let keyed = self
            .session
            .execute(&DeviceRequest::ChangePassphrase {
                cipher: report.cipher,
                new_blob: Some(new_blob.to_vec()),
                old_blob: None,
            })
            .and_then(DeviceResponse::done);
        if let Err(err) = keyed {
            if let Err(restore_err) = self.write_block(previous) {
                warn!(
                    "could not restore security block on {}: {restore_err}",
                    self.path()
                );
            }
            return Err(err);
        }

        self.session.attempts_mut().reset();
        info!("user password configured on {}", self.path());
        self.confirm(Operation::SetPassword, status)
    }

    /// Authenticate with the user password.
    ///
    /// A rejected password counts against the drive's attempt limit; the
    /// attempt that reaches the limit fails with [`SedError::AttemptsExceeded`]
    /// and every later call is refused without reaching the drive.
    pub fn unlock(&mut self, password: &str) -> SedResult<SecurityStatus> {
        let (status, report) = self.session.snapshot()?;
        status.require(Operation::Unlock)?;
        if password.is_empty() {
            return Err(SedError::EmptyPassword);
        }

        let kdf = self.current_kdf()?;
        let blob = derive_blob(report.blob_len()?, &kdf, password)?;
        self.present(status, blob)
    }

    /// Authenticate with a precomputed password blob.
    pub fn unlock_with_blob(&mut self, blob: &[u8]) -> SedResult<SecurityStatus> {
        let (status, report) = self.session.snapshot()?;
        status.require(Operation::Unlock)?;
        let expected = report.blob_len()?;
        if blob.len() != expected {
            return Err(SedError::InvalidArgument(format!(
                "password blob is {} bytes; {} expects {expected}",
                blob.len(),
                report.cipher
            )));
        }
        self.present(status, Zeroizing::new(blob.to_vec()))
    }

    /// Blob the drive would accept for `password`, without sending it.
    pub fn password_blob(&mut self, password: &str) -> SedResult<Zeroizing<Vec<u8>>> {
        let report = self.session.encryption_report()?;
        let kdf = self.current_kdf()?;
        derive_blob(report.blob_len()?, &kdf, password)
    }

    /// Replace the password (and hint) of an unlocked drive.
    pub fn change_password(
        &mut self,
        current: &str,
        new_password: &str,
        new_hint: &str,
    ) -> SedResult<SecurityStatus> {
        let (status, report) = self.session.snapshot()?;
        status.require(Operation::ChangePassword)?;
        if current.is_empty() || new_password.is_empty() {
            return Err(SedError::EmptyPassword);
        }
        validate_hint(new_hint)?;

        let base = self.kdf_params()?;
        let old_kdf = self.overrides.current.apply(base);
        let new_kdf = self.overrides.new.apply(base);
        let blob_len = report.blob_len()?;
        let old_blob = derive_blob(blob_len, &old_kdf, current)?;
        let new_blob = derive_blob(blob_len, &new_kdf, new_password)?;
        let block = SecurityBlock::new(new_kdf, new_hint)?;
        self.rekey(report.cipher, Some(new_blob), old_blob, &block)?;

        info!("user password changed on {}", self.path());
        self.confirm(Operation::ChangePassword, status)
    }

    /// Drop the user password from an unlocked drive.
    pub fn remove_password(&mut self, current: &str) -> SedResult<SecurityStatus> {
        let (status, report) = self.session.snapshot()?;
        status.require(Operation::RemovePassword)?;
        if current.is_empty() {
            return Err(SedError::EmptyPassword);
        }

        let base = self.kdf_params()?;
        let old_blob = derive_blob(report.blob_len()?, &self.overrides.current.apply(base), current)?;
        let block = SecurityBlock::new(base, "")?;
        self.rekey(report.cipher, None, old_blob, &block)?;

        info!("user password removed from {}", self.path());
        self.confirm(Operation::RemovePassword, status)
    }

    /// Hand `blob` to the drive and account for the outcome.
    fn present(
        &mut self,
        before: SecurityStatus,
        blob: Zeroizing<Vec<u8>>,
    ) -> SedResult<SecurityStatus> {
        let outcome = self
            .session
            .execute(&DeviceRequest::Unlock { blob: blob.to_vec() })
            .and_then(DeviceResponse::done);

        match outcome {
            Ok(()) => {
                self.session.attempts_mut().reset();
                info!("{} unlocked", self.path());
                self.confirm(Operation::Unlock, before)
            }
            Err(SedError::WrongPassword) => {
                let attempts = self.session.attempts_mut();
                if attempts.record_failure() {
                    warn!(
                        "{} rejected the password; attempt limit of {} reached",
                        self.path(),
                        self.session.attempts().limit()
                    );
                    Err(SedError::AttemptsExceeded)
                } else {
                    info!(
                        "{} rejected the password; {} attempt(s) left",
                        self.path(),
                        self.session.attempts().remaining()
                    );
                    Err(SedError::WrongPassword)
                }
            }
            Err(SedError::AttemptsExceeded) => {
                self.session.attempts_mut().mark_exhausted();
                warn!("{} reports its unlock attempts exhausted", self.path());
                Err(SedError::AttemptsExceeded)
            }
            Err(err) => Err(err),
        }
    }

    fn read_raw_block(&mut self) -> SedResult<Vec<u8>> {
        self.session
            .execute(&DeviceRequest::ReadHandyStore {
                index: SECURITY_BLOCK_INDEX,
            })?
            .into_block()
    }

    fn write_block(&mut self, data: Vec<u8>) -> SedResult<()> {
        self.session
            .execute(&DeviceRequest::WriteHandyStore {
                index: SECURITY_BLOCK_INDEX,
                data,
            })
            .and_then(DeviceResponse::done)
    }

    fn security_block(&mut self) -> SedResult<Option<SecurityBlock>> {
        let raw = self.read_raw_block()?;
        Ok(SecurityBlock::decode(&raw))
    }

    fn stored_or_default(&self, raw: &[u8]) -> KdfParams {
        match SecurityBlock::decode(raw) {
            Some(block) => block.kdf,
            None => {
                warn!(
                    "{} carries no security block; using default salt",
                    self.path()
                );
                self.defaults
            }
        }
    }

    fn kdf_params(&mut self) -> SedResult<KdfParams> {
        let raw = self.read_raw_block()?;
        Ok(self.stored_or_default(&raw))
    }

    fn current_kdf(&mut self) -> SedResult<KdfParams> {
        let base = self.kdf_params()?;
        Ok(self.overrides.current.apply(base))
    }

    /// Switch the credential of an unlocked drive, then persist the matching
    /// metadata.
    ///
    /// When the metadata write fails the credential switch is undone so the
    /// drive never holds a password whose salt is not recorded.
    fn rekey(
        &mut self,
        cipher: Cipher,
        new_blob: Option<Zeroizing<Vec<u8>>>,
        old_blob: Zeroizing<Vec<u8>>,
        block: &SecurityBlock,
    ) -> SedResult<()> {
        let encoded = block.encode()?;
        self.session
            .execute(&DeviceRequest::ChangePassphrase {
                cipher,
                new_blob: new_blob.as_ref().map(|blob| blob.to_vec()),
                old_blob: Some(old_blob.to_vec()),
            })?
            .done()?;

        let Err(err) = self.write_block(encoded) else {
            return Ok(());
        };

        error!(
            "failed to store security block on {}: {err}; restoring previous credential",
            self.path()
        );
        let rollback = self
            .session
            .execute(&DeviceRequest::ChangePassphrase {
                cipher,
                new_blob: Some(old_blob.to_vec()),
                old_blob: new_blob.as_ref().map(|blob| blob.to_vec()),
            })
            .and_then(DeviceResponse::done);
        match rollback {
            Ok(()) => warn!("previous credential restored on {}", self.path()),
            Err(rollback_err) => error!(
                "could not restore previous credential on {}: {rollback_err}",
                self.path()
            ),
        }
        Err(SedError::Transport(format!(
            "security metadata write failed: {err}"
        )))
    }

    /// Re-read the live status and flag drives that disagree with the table.
    fn confirm(&mut self, operation: Operation, before: SecurityStatus) -> SedResult<SecurityStatus> {
        let expected = before.after(operation, self.session.profile().post_setup_state);
        let actual = self.session.security_status()?;
        if actual != expected {
            warn!(
                "{} reports {actual} after {}; expected {expected}",
                self.path(),
                operation.label()
            );
        }
        Ok(actual)
    }

    fn path(&self) -> String {
        self.session.drive().path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionSettings, SessionSlot};
    use crate::sim::{Fault, SimDrive, SimulatedTransport};
    use crate::metadata::HANDY_STORE_BLOCK_SIZE;
    use crate::status::PostSetupState;
    use std::path::Path;

    const DRIVE: &str = "/dev/a";

    fn bound(drive: SimDrive) -> (SimulatedTransport, SessionSlot<SimulatedTransport>) {
        let sim = SimulatedTransport::new().with_drive(drive);
        let mut slot = SessionSlot::new(sim.clone(), SessionSettings::default());
        slot.open_device(Path::new(DRIVE)).unwrap();
        (sim, slot)
    }

    fn service(
        slot: &mut SessionSlot<SimulatedTransport>,
    ) -> CredentialService<'_, crate::sim::SimHandle> {
        let defaults = slot.settings().default_kdf;
        CredentialService::new(slot.session().unwrap(), defaults)
    }

    fn locked_drive(password: &str, limit: u32) -> (SimulatedTransport, SessionSlot<SimulatedTransport>) {
        let (sim, mut slot) = bound(
            SimDrive::new(DRIVE, "SSD1")
                .attempt_limit(limit)
                .post_setup(PostSetupState::Locked),
        );
        service(&mut slot).set_password(password, "").unwrap();
        (sim, slot)
    }

    #[test]
    fn unlock_without_password_is_rejected_before_the_drive() {
        let (sim, mut slot) = bound(SimDrive::new(DRIVE, "SSD1"));
        let err = service(&mut slot).unlock("x").unwrap_err();
        assert!(matches!(
            err,
            SedError::InvalidState {
                status: SecurityStatus::NoUserPassword,
                ..
            }
        ));
        assert_eq!(sim.request_count(DRIVE, "unlock"), 0);
        assert_eq!(
            slot.session().unwrap().security_status().unwrap(),
            SecurityStatus::NoUserPassword
        );
    }

    #[test]
    fn set_then_unlock_round_trip_keeps_hint() {
        let (sim, mut slot) = bound(
            SimDrive::new(DRIVE, "SSD1").post_setup(PostSetupState::Unlocked),
        );
        let status = service(&mut slot).set_password("p1", "h1").unwrap();
        assert_eq!(status, SecurityStatus::Unlocked);

        sim.power_cycle(DRIVE);
        let session = slot.session().unwrap();
        assert_eq!(session.security_status().unwrap(), SecurityStatus::Locked);

        let status = service(&mut slot).unlock("p1").unwrap();
        assert_eq!(status, SecurityStatus::Unlocked);
        assert_eq!(service(&mut slot).hint().unwrap(), "h1");
    }

    #[test]
    fn set_password_rejects_empty_and_configured() {
        let (_sim, mut slot) = bound(SimDrive::new(DRIVE, "SSD1"));
        assert!(matches!(
            service(&mut slot).set_password("", "hint"),
            Err(SedError::EmptyPassword)
        ));
        service(&mut slot).set_password("pw", "").unwrap();
        assert!(matches!(
            service(&mut slot).set_password("other", ""),
            Err(SedError::AlreadyConfigured)
        ));
    }

    #[test]
    fn oversized_hint_never_reaches_the_drive() {
        let (sim, mut slot) = bound(SimDrive::new(DRIVE, "SSD1"));
        let err = service(&mut slot)
            .set_password("pw", &"h".repeat(101))
            .unwrap_err();
        assert!(matches!(err, SedError::InvalidArgument(_)));
        assert_eq!(sim.request_count(DRIVE, "change_passphrase"), 0);
    }

    #[test]
    fn lockout_after_limit_wrong_attempts() {
        let limit = 3;
        let (sim, mut slot) = locked_drive("right", limit);

        for _ in 0..limit - 1 {
            assert!(matches!(
                service(&mut slot).unlock("wrong"),
                Err(SedError::WrongPassword)
            ));
        }
        assert!(matches!(
            service(&mut slot).unlock("wrong"),
            Err(SedError::AttemptsExceeded)
        ));
        assert_eq!(sim.request_count(DRIVE, "unlock"), limit);

        assert_eq!(
            slot.session().unwrap().security_status().unwrap(),
            SecurityStatus::UnlockAttemptExceeded
        );
        assert!(matches!(
            service(&mut slot).unlock("right"),
            Err(SedError::AttemptsExceeded)
        ));
        assert_eq!(sim.request_count(DRIVE, "unlock"), limit);
    }

    #[test]
    fn successful_unlock_resets_the_counter() {
        let (sim, mut slot) = locked_drive("right", 3);
        service(&mut slot).unlock("wrong").unwrap_err();
        service(&mut slot).unlock("wrong").unwrap_err();
        service(&mut slot).unlock("right").unwrap();
        assert_eq!(slot.session().unwrap().attempts().failures(), 0);

        sim.power_cycle(DRIVE);
        service(&mut slot).unlock("wrong").unwrap_err();
        service(&mut slot).unlock("wrong").unwrap_err();
        assert_eq!(
            slot.session().unwrap().security_status().unwrap(),
            SecurityStatus::Locked
        );
    }

    #[test]
    fn change_password_is_atomic_on_failure() {
        let (sim, mut slot) = locked_drive("old", 5);
        service(&mut slot).unlock("old").unwrap();

        sim.inject_fault(DRIVE, "change_passphrase", Fault::AfterVerify);
        assert!(matches!(
            service(&mut slot).change_password("old", "new", "h"),
            Err(SedError::Transport(_))
        ));
        sim.clear_faults(DRIVE);

        sim.power_cycle(DRIVE);
        assert!(matches!(
            service(&mut slot).unlock("new"),
            Err(SedError::WrongPassword)
        ));
        service(&mut slot).unlock("old").unwrap();
    }

    #[test]
    fn change_password_with_wrong_current_keeps_state() {
        let (_sim, mut slot) = locked_drive("old", 5);
        service(&mut slot).unlock("old").unwrap();
        assert!(matches!(
            service(&mut slot).change_password("nope", "new", ""),
            Err(SedError::WrongPassword)
        ));
        assert_eq!(
            slot.session().unwrap().security_status().unwrap(),
            SecurityStatus::Unlocked
        );
    }

    #[test]
    fn change_password_updates_hint() {
        let (sim, mut slot) = locked_drive("old", 5);
        service(&mut slot).unlock("old").unwrap();
        service(&mut slot)
            .change_password("old", "new", "second")
            .unwrap();
        assert_eq!(service(&mut slot).hint().unwrap(), "second");

        sim.power_cycle(DRIVE);
        service(&mut slot).unlock("new").unwrap();
    }

    #[test]
    fn failed_metadata_write_rolls_back_the_credential() {
        let (sim, mut slot) = locked_drive("old", 5);
        service(&mut slot).unlock("old").unwrap();

        sim.inject_fault(DRIVE, "write_handy_store", Fault::Fail);
        assert!(service(&mut slot)
            .change_password("old", "new", "")
            .is_err());
        sim.clear_faults(DRIVE);

        sim.power_cycle(DRIVE);
        service(&mut slot).unlock("old").unwrap();
    }

    #[test]
    fn set_password_on_locking_drive_leaves_it_blank_when_metadata_fails() {
        let (sim, mut slot) = bound(
            SimDrive::new(DRIVE, "SSD1").post_setup(PostSetupState::Locked),
        );
        sim.inject_fault(DRIVE, "write_handy_store", Fault::Fail);
        assert!(matches!(
            service(&mut slot).set_password("pw", "hint"),
            Err(SedError::Transport(_))
        ));
        sim.clear_faults(DRIVE);

        assert_eq!(sim.request_count(DRIVE, "change_passphrase"), 0);
        assert_eq!(
            slot.session().unwrap().security_status().unwrap(),
            SecurityStatus::NoUserPassword
        );
        service(&mut slot).set_password("pw", "hint").unwrap();
    }

    #[test]
    fn set_password_restores_the_block_when_keying_fails() {
        let (sim, mut slot) = bound(SimDrive::new(DRIVE, "SSD1"));
        sim.inject_fault(DRIVE, "change_passphrase", Fault::Fail);
        assert!(service(&mut slot).set_password("pw", "hint").is_err());
        sim.clear_faults(DRIVE);

        assert_eq!(service(&mut slot).hint().unwrap(), "");
        assert_eq!(
            slot.session().unwrap().security_status().unwrap(),
            SecurityStatus::NoUserPassword
        );
    }

    #[test]
    fn overridden_salt_reaches_a_drive_without_its_block() {
        let custom = CredentialOverrides {
            new: KdfOverride::parse(Some("ab"), Some(10)).unwrap(),
            ..CredentialOverrides::default()
        };
        let (sim, mut slot) = bound(SimDrive::new(DRIVE, "SSD1"));
        service(&mut slot)
            .with_overrides(custom)
            .set_password("pw", "")
            .unwrap();

        slot.session()
            .unwrap()
            .execute(&DeviceRequest::WriteHandyStore {
                index: SECURITY_BLOCK_INDEX,
                data: vec![0; HANDY_STORE_BLOCK_SIZE],
            })
            .unwrap();
        sim.power_cycle(DRIVE);

        assert!(matches!(
            service(&mut slot).unlock("pw"),
            Err(SedError::WrongPassword)
        ));
        let recovery = CredentialOverrides {
            current: custom.new,
            ..CredentialOverrides::default()
        };
        let status = service(&mut slot)
            .with_overrides(recovery)
            .unlock("pw")
            .unwrap();
        assert_eq!(status, SecurityStatus::Unlocked);
    }

    #[test]
    fn change_password_honours_old_and_new_overrides() {
        let (sim, mut slot) = locked_drive("old", 5);
        service(&mut slot).unlock("old").unwrap();

        let overrides = CredentialOverrides {
            current: KdfOverride::default(),
            new: KdfOverride::parse(None, Some(7)).unwrap(),
        };
        service(&mut slot)
            .with_overrides(overrides)
            .change_password("old", "new", "")
            .unwrap();

        sim.power_cycle(DRIVE);
        service(&mut slot).unlock("new").unwrap();
    }

    #[test]
    fn precomputed_blob_unlocks_the_drive() {
        let (sim, mut slot) = locked_drive("pw", 5);
        let blob = service(&mut slot).password_blob("pw").unwrap();
        assert_eq!(blob.len(), 32);

        assert!(matches!(
            service(&mut slot).unlock_with_blob(&blob[..16]),
            Err(SedError::InvalidArgument(_))
        ));
        assert_eq!(sim.request_count(DRIVE, "unlock"), 0);

        let status = service(&mut slot).unlock_with_blob(&blob).unwrap();
        assert_eq!(status, SecurityStatus::Unlocked);
    }

    #[test]
    fn wrong_blob_counts_against_the_limit() {
        let (_sim, mut slot) = locked_drive("pw", 2);
        assert!(matches!(
            service(&mut slot).unlock_with_blob(&[0; 32]),
            Err(SedError::WrongPassword)
        ));
        assert!(matches!(
            service(&mut slot).unlock_with_blob(&[1; 32]),
            Err(SedError::AttemptsExceeded)
        ));
    }

    #[test]
    fn remove_password_returns_to_no_user_password() {
        let (_sim, mut slot) = locked_drive("pw", 5);
        service(&mut slot).unlock("pw").unwrap();
        let status = service(&mut slot).remove_password("pw").unwrap();
        assert_eq!(status, SecurityStatus::NoUserPassword);
        assert_eq!(service(&mut slot).hint().unwrap(), "");
    }

    #[test]
    fn remove_password_requires_unlocked() {
        let (_sim, mut slot) = locked_drive("pw", 5);
        assert!(matches!(
            service(&mut slot).remove_password("pw"),
            Err(SedError::InvalidState {
                status: SecurityStatus::Locked,
                ..
            })
        ));
    }

    #[test]
    fn hint_of_blank_drive_is_empty() {
        let (_sim, mut slot) = bound(SimDrive::new(DRIVE, "SSD1"));
        assert_eq!(service(&mut slot).hint().unwrap(), "");
    }

    #[test]
    fn hint_surfaces_transport_faults() {
        let (sim, mut slot) = bound(SimDrive::new(DRIVE, "SSD1"));
        sim.inject_fault(DRIVE, "read_handy_store", Fault::Fail);
        assert!(matches!(
            service(&mut slot).hint(),
            Err(SedError::Transport(_))
        ));
    }

    #[test]
    fn credential_operations_refused_without_encryption() {
        let (_sim, mut slot) = bound(SimDrive::new(DRIVE, "Plain").without_encryption());
        assert!(matches!(
            service(&mut slot).set_password("pw", ""),
            Err(SedError::NotEncryptionCapable)
        ));
    }
}
