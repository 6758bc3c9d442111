//! Binding between the process and the one drive it currently manages.

use crate::config::SedlockConfig;
use crate::error::{SedError, SedResult};
use crate::kdf::KdfParams;
use crate::status::{AttemptTracker, SecurityFacts, SecurityStatus};
use crate::transport::{
    DeviceHandle, DeviceProfile, DeviceRequest, DeviceResponse, Drive, DriveTransport,
    EncryptionReport,
};
use log::{debug, info, warn};
use std::path::Path;

/// Operational settings the controller applies to every bound drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub default_kdf: KdfParams,
    pub product_filter: Option<String>,
    pub discard_after_erase: bool,
}

impl SessionSettings {
    pub fn from_config(config: &SedlockConfig) -> SedResult<Self> {
        Ok(Self {
            default_kdf: config.default_kdf()?,
            product_filter: config.transport.product_filter.clone(),
            discard_after_erase: config.erase.discard_blocks,
        })
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_kdf: KdfParams {
                salt: [87, 0, 68, 0, 67, 0, 46, 0],
                iterations: 1000,
            },
            product_filter: None,
            discard_after_erase: true,
        }
    }
}

/// An open drive together with the session's view of its lockout counter.
pub struct DeviceSession<H: DeviceHandle> {
    drive: Drive,
    handle: H,
    profile: DeviceProfile,
    attempts: AttemptTracker,
}

impl<H: DeviceHandle> DeviceSession<H> {
    pub fn new(drive: Drive, handle: H) -> Self {
        let profile = handle.profile();
        Self {
            drive,
            handle,
            profile,
            attempts: AttemptTracker::new(profile.unlock_attempt_limit),
        }
    }

    pub fn drive(&self) -> &Drive {
        &self.drive
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    pub fn attempts(&self) -> &AttemptTracker {
        &self.attempts
    }

    pub(crate) fn attempts_mut(&mut self) -> &mut AttemptTracker {
        &mut self.attempts
    }

    /// Send one request to the drive.
    pub fn execute(&mut self, request: &DeviceRequest) -> SedResult<DeviceResponse> {
        debug!("{} -> {}", self.drive.path.display(), request.kind());
        let result = self.handle.execute(request);
        if let Err(err) = &result {
            debug!(
                "{} <- {} failed: {err}",
                self.drive.path.display(),
                request.kind()
            );
        }
        result
    }

    pub fn encryption_report(&mut self) -> SedResult<EncryptionReport> {
        self.execute(&DeviceRequest::EncryptionStatus)?.into_report()
    }

    /// Query the drive and derive its status together with the raw report.
    pub fn snapshot(&mut self) -> SedResult<(SecurityStatus, EncryptionReport)> {
        let report = self.encryption_report()?;
        let facts = SecurityFacts::from_report(&report)?;
        if facts.hardware_lockout && !self.attempts.exhausted() {
            self.attempts.mark_exhausted();
        }
        Ok((SecurityStatus::derive(facts, &self.attempts), report))
    }

    /// Live security status; never served from a cache.
    pub fn security_status(&mut self) -> SedResult<SecurityStatus> {
        self.snapshot().map(|(status, _)| status)
    }
}

/// Owns the transport and at most one bound drive.
pub struct SessionSlot<T: DriveTransport> {
    transport: T,
    settings: SessionSettings,
    bound: Option<DeviceSession<T::Handle>>,
}

impl<T: DriveTransport> SessionSlot<T> {
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        Self {
            transport,
            settings,
            bound: None,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn list_drives(&self) -> SedResult<Vec<Drive>> {
        self.transport.enumerate()
    }

    /// Bind `path`, replacing the current binding only once the new drive is
    /// open and accepted. A failed open leaves the previous binding in place,
    /// except when `path` is the bound drive itself: its handle has to be
    /// released before it can be opened again.
    pub fn open_device(&mut self, path: &Path) -> SedResult<&Drive> {
        let drive = self
            .transport
            .enumerate()?
            .into_iter()
            .find(|drive| drive.path == path)
            .ok_or_else(|| SedError::DeviceNotFound(path.to_path_buf()))?;

        if self.current_device() == Some(path) {
            if let Some(previous) = self.bound.take() {
                info!("reopening {}", previous.drive.path.display());
            }
        }

        let handle = self.transport.open(path)?;
        let mut session = DeviceSession::new(drive, handle);

        if let Some(filter) = &self.settings.product_filter {
            let product = session
                .execute(&DeviceRequest::ProductIdentification)?
                .into_product()?;
            if !product.to_lowercase().contains(&filter.to_lowercase()) {
                warn!(
                    "{} identifies as `{}`, expected a `{}` device",
                    path.display(),
                    product.trim(),
                    filter
                );
                return Err(SedError::DeviceNotFound(path.to_path_buf()));
            }
        }

        if let Some(previous) = self.bound.take() {
            info!("releasing {}", previous.drive.path.display());
        }
        info!(
            "bound {} ({})",
            path.display(),
            if session.drive.name.is_empty() {
                "unnamed"
            } else {
                session.drive.name.as_str()
            }
        );
        Ok(&self.bound.insert(session).drive)
    }

    /// Release the bound drive, if any.
    pub fn close_device(&mut self) -> Option<Drive> {
        self.bound.take().map(|session| {
            info!("closed {}", session.drive.path.display());
            session.drive
        })
    }

    pub fn current_device(&self) -> Option<&Path> {
        self.bound.as_ref().map(|session| session.drive.path.as_path())
    }

    /// The bound session, or [`SedError::NoDeviceBound`].
    pub fn session(&mut self) -> SedResult<&mut DeviceSession<T::Handle>> {
        self.bound.as_mut().ok_or(SedError::NoDeviceBound)
    }

    /// Split borrow used by the credential and configuration services.
    pub(crate) fn session_with_settings(
        &mut self,
    ) -> SedResult<(&mut DeviceSession<T::Handle>, &SessionSettings)> {
        match self.bound.as_mut() {
            Some(session) => Ok((session, &self.settings)),
            None => Err(SedError::NoDeviceBound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDrive, SimulatedTransport};
    use std::path::PathBuf;

    fn two_drives() -> SimulatedTransport {
        SimulatedTransport::new()
            .with_drive(SimDrive::new("/dev/a", "SSD1"))
            .with_drive(SimDrive::new("/dev/b", ""))
    }

    #[test]
    fn current_device_is_empty_before_open() {
        let slot = SessionSlot::new(two_drives(), SessionSettings::default());
        assert!(slot.current_device().is_none());
    }

    #[test]
    fn rebinding_releases_previous_handle() {
        let sim = two_drives();
        let mut slot = SessionSlot::new(sim.clone(), SessionSettings::default());

        slot.open_device(Path::new("/dev/b")).unwrap();
        assert_eq!(slot.current_device(), Some(Path::new("/dev/b")));
        assert!(sim.is_open("/dev/b"));

        slot.open_device(Path::new("/dev/a")).unwrap();
        assert_eq!(slot.current_device(), Some(Path::new("/dev/a")));
        assert!(!sim.is_open("/dev/b"));
        assert!(sim.is_open("/dev/a"));
    }

    #[test]
    fn reopening_the_same_drive_succeeds() {
        let mut slot = SessionSlot::new(two_drives(), SessionSettings::default());
        slot.open_device(Path::new("/dev/a")).unwrap();
        slot.open_device(Path::new("/dev/a")).unwrap();
        assert_eq!(slot.current_device(), Some(Path::new("/dev/a")));
    }

    #[test]
    fn unknown_path_is_not_found() {
        let mut slot = SessionSlot::new(two_drives(), SessionSettings::default());
        let err = slot.open_device(Path::new("/dev/zz")).unwrap_err();
        match err {
            SedError::DeviceNotFound(path) => assert_eq!(path, PathBuf::from("/dev/zz")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(slot.current_device().is_none());
    }

    #[test]
    fn failed_open_keeps_the_bound_drive() {
        let sim = two_drives();
        let mut slot = SessionSlot::new(sim.clone(), SessionSettings::default());
        slot.open_device(Path::new("/dev/a")).unwrap();

        assert!(matches!(
            slot.open_device(Path::new("/dev/typo")),
            Err(SedError::DeviceNotFound(_))
        ));
        assert_eq!(slot.current_device(), Some(Path::new("/dev/a")));
        assert!(sim.is_open("/dev/a"));
        assert_eq!(
            slot.session().unwrap().security_status().unwrap(),
            SecurityStatus::NoUserPassword
        );
    }

    #[test]
    fn rejected_product_keeps_the_bound_drive() {
        let sim = SimulatedTransport::new()
            .with_drive(SimDrive::new("/dev/a", "Thumb").product("Generic Flash"))
            .with_drive(SimDrive::new("/dev/b", "Passport").product("My Passport 25E2"));
        let settings = SessionSettings {
            product_filter: Some("my passport".into()),
            ..SessionSettings::default()
        };
        let mut slot = SessionSlot::new(sim.clone(), settings);
        slot.open_device(Path::new("/dev/b")).unwrap();

        assert!(slot.open_device(Path::new("/dev/a")).is_err());
        assert_eq!(slot.current_device(), Some(Path::new("/dev/b")));
        assert!(sim.is_open("/dev/b"));
        assert!(!sim.is_open("/dev/a"));
    }

    #[test]
    fn operations_without_binding_fail() {
        let mut slot = SessionSlot::new(two_drives(), SessionSettings::default());
        assert!(matches!(slot.session(), Err(SedError::NoDeviceBound)));
    }

    #[test]
    fn product_filter_rejects_foreign_drives() {
        let sim = SimulatedTransport::new()
            .with_drive(SimDrive::new("/dev/a", "Thumb").product("Generic Flash"))
            .with_drive(SimDrive::new("/dev/b", "Passport").product("My Passport 25E2"));
        let settings = SessionSettings {
            product_filter: Some("my passport".into()),
            ..SessionSettings::default()
        };
        let mut slot = SessionSlot::new(sim.clone(), settings);

        assert!(matches!(
            slot.open_device(Path::new("/dev/a")),
            Err(SedError::DeviceNotFound(_))
        ));
        assert!(!sim.is_open("/dev/a"));
        slot.open_device(Path::new("/dev/b")).unwrap();
    }

    #[test]
    fn second_transport_open_is_busy() {
        let sim = two_drives();
        let mut first = SessionSlot::new(sim.clone(), SessionSettings::default());
        let mut second = SessionSlot::new(sim, SessionSettings::default());
        first.open_device(Path::new("/dev/a")).unwrap();
        assert!(matches!(
            second.open_device(Path::new("/dev/a")),
            Err(SedError::DeviceBusy { .. })
        ));
    }
}
