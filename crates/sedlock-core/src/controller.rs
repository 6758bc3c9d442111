//! Serialized front door for every drive operation.
//!
//! A single worker thread owns the [`SessionSlot`]; callers on any thread
//! submit closures through a FIFO channel and wait for the reply with a
//! bounded timeout. At most one request touches the drive at a time.
//!
//! A request whose caller gives up while it is still queued is withdrawn and
//! never reaches the drive. One that is already running finishes, its result
//! is dropped, and the worker re-derives the drive's status before the next
//! request.

use crate::credentials::{CredentialOverrides, CredentialService};
use crate::error::{SedError, SedResult};
use crate::kdf::KdfOverride;
use crate::report::{DeviceInfo, DiagnosticReport};
use crate::session::{SessionSettings, SessionSlot};
use crate::settings::{ConfigurationService, EraseOptions, SleepTimer};
use crate::status::SecurityStatus;
use crate::transport::{Drive, DriveTransport};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use zeroize::Zeroizing;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const WITHDRAWN: u8 = 2;

struct Job<T: DriveTransport> {
    label: &'static str,
    state: Arc<AtomicU8>,
    run: Box<dyn FnOnce(&mut SessionSlot<T>) + Send>,
}

type BoundMirror = Arc<Mutex<Option<PathBuf>>>;

pub struct DeviceController<T: DriveTransport> {
    sender: Option<mpsc::Sender<Job<T>>>,
    worker: Option<JoinHandle<()>>,
    bound: BoundMirror,
    abandoned: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl<T> DeviceController<T>
where
    T: DriveTransport + Send + 'static,
{
    /// Spawn the worker that will own `transport`.
    pub fn new(
        transport: T,
        settings: SessionSettings,
        request_timeout: Duration,
    ) -> SedResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job<T>>();
        let abandoned = Arc::new(AtomicBool::new(false));
        let worker_abandoned = Arc::clone(&abandoned);

        let worker = thread::Builder::new()
            .name("sedlock-controller".into())
            .spawn(move || {
                let mut slot = SessionSlot::new(transport, settings);
                while let Ok(job) = receiver.recv() {
                    if job
                        .state
                        .compare_exchange(QUEUED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        debug!("skipping withdrawn request: {}", job.label);
                        continue;
                    }
                    if worker_abandoned.swap(false, Ordering::SeqCst) {
                        reverify(&mut slot);
                    }
                    (job.run)(&mut slot);
                }
                if let Some(drive) = slot.close_device() {
                    debug!("controller stopped; released {}", drive.path.display());
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            bound: Arc::new(Mutex::new(None)),
            abandoned,
            request_timeout,
        })
    }

    /// Run `f` on the worker and wait for its result.
    fn submit<R, F>(&self, label: &'static str, f: F) -> SedResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SessionSlot<T>) -> SedResult<R> + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| SedError::Transport("controller is shut down".into()))?;
        let state = Arc::new(AtomicU8::new(QUEUED));
        let (reply, response) = mpsc::sync_channel(1);
        sender
            .send(Job {
                label,
                state: Arc::clone(&state),
                run: Box::new(move |slot: &mut SessionSlot<T>| {
                    let _ = reply.send(f(slot));
                }),
            })
            .map_err(|_| SedError::Transport("controller worker has stopped".into()))?;

        match response.recv_timeout(self.request_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let withdrawn = state
                    .compare_exchange(QUEUED, WITHDRAWN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
                if withdrawn {
                    warn!(
                        "{label} still queued after {:?}; withdrawn",
                        self.request_timeout
                    );
                } else {
                    warn!(
                        "{label} did not finish within {:?}; result will be discarded",
                        self.request_timeout
                    );
                    self.abandoned.store(true, Ordering::SeqCst);
                }
                Err(SedError::Cancelled(format!(
                    "{label} timed out after {:?}",
                    self.request_timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("{label} was dropped by the controller worker");
                Err(SedError::Transport(format!("{label} was not completed")))
            }
        }
    }

    pub fn list_drives(&self) -> SedResult<Vec<Drive>> {
        self.submit("list drives", |slot| slot.list_drives())
    }

    /// Bind `path`. The previous binding survives a failed open unless
    /// `path` names the bound drive itself.
    pub fn open_device(&self, path: impl AsRef<Path>) -> SedResult<Drive> {
        let path = path.as_ref().to_path_buf();
        let bound = Arc::clone(&self.bound);
        self.submit("open device", move |slot| {
            let result = slot.open_device(&path).cloned();
            mirror(&bound, slot);
            result
        })
    }

    pub fn close_device(&self) -> SedResult<Option<Drive>> {
        let bound = Arc::clone(&self.bound);
        self.submit("close device", move |slot| {
            let closed = slot.close_device();
            mirror(&bound, slot);
            Ok(closed)
        })
    }

    /// Identifier of the bound drive; never blocks on the worker.
    pub fn current_device(&self) -> Option<PathBuf> {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn security_status(&self) -> SedResult<SecurityStatus> {
        self.submit("security status", |slot| slot.session()?.security_status())
    }

    pub fn device_info(&self) -> SedResult<DeviceInfo> {
        self.submit("device info", |slot| configure(slot)?.info())
    }

    pub fn password_hint(&self) -> SedResult<String> {
        self.submit("read hint", |slot| {
            credentials(slot, CredentialOverrides::default())?.hint()
        })
    }

    pub fn unlock(&self, password: &str) -> SedResult<SecurityStatus> {
        self.unlock_with(password, KdfOverride::default())
    }

    /// Unlock, deriving the blob with `kdf` in place of the stored parameters.
    pub fn unlock_with(&self, password: &str, kdf: KdfOverride) -> SedResult<SecurityStatus> {
        let password = Zeroizing::new(password.to_string());
        let overrides = CredentialOverrides {
            current: kdf,
            ..CredentialOverrides::default()
        };
        self.submit("unlock", move |slot| {
            credentials(slot, overrides)?.unlock(&password)
        })
    }

    pub fn unlock_with_blob(&self, blob: &[u8]) -> SedResult<SecurityStatus> {
        let blob = Zeroizing::new(blob.to_vec());
        self.submit("unlock with blob", move |slot| {
            credentials(slot, CredentialOverrides::default())?.unlock_with_blob(&blob)
        })
    }

    /// The blob the bound drive would accept for `password`.
    pub fn password_blob(
        &self,
        password: &str,
        kdf: KdfOverride,
    ) -> SedResult<Zeroizing<Vec<u8>>> {
        let password = Zeroizing::new(password.to_string());
        let overrides = CredentialOverrides {
            current: kdf,
            ..CredentialOverrides::default()
        };
        self.submit("generate blob", move |slot| {
            credentials(slot, overrides)?.password_blob(&password)
        })
    }

    pub fn set_password(&self, password: &str, hint: &str) -> SedResult<SecurityStatus> {
        self.set_password_with(password, hint, KdfOverride::default())
    }

    pub fn set_password_with(
        &self,
        password: &str,
        hint: &str,
        kdf: KdfOverride,
    ) -> SedResult<SecurityStatus> {
        let password = Zeroizing::new(password.to_string());
        let hint = hint.to_string();
        let overrides = CredentialOverrides {
            new: kdf,
            ..CredentialOverrides::default()
        };
        self.submit("set password", move |slot| {
            credentials(slot, overrides)?.set_password(&password, &hint)
        })
    }

    pub fn change_password(
        &self,
        current: &str,
        new_password: &str,
        new_hint: &str,
    ) -> SedResult<SecurityStatus> {
        self.change_password_with(current, new_password, new_hint, CredentialOverrides::default())
    }

    pub fn change_password_with(
        &self,
        current: &str,
        new_password: &str,
        new_hint: &str,
        overrides: CredentialOverrides,
    ) -> SedResult<SecurityStatus> {
        let current = Zeroizing::new(current.to_string());
        let new_password = Zeroizing::new(new_password.to_string());
        let new_hint = new_hint.to_string();
        self.submit("change password", move |slot| {
            credentials(slot, overrides)?.change_password(&current, &new_password, &new_hint)
        })
    }

    pub fn remove_password(&self, current: &str) -> SedResult<SecurityStatus> {
        self.remove_password_with(current, KdfOverride::default())
    }

    pub fn remove_password_with(
        &self,
        current: &str,
        kdf: KdfOverride,
    ) -> SedResult<SecurityStatus> {
        let current = Zeroizing::new(current.to_string());
        let overrides = CredentialOverrides {
            current: kdf,
            ..CredentialOverrides::default()
        };
        self.submit("remove password", move |slot| {
            credentials(slot, overrides)?.remove_password(&current)
        })
    }

    pub fn sleep_timer(&self) -> SedResult<SleepTimer> {
        self.submit("read sleep timer", |slot| configure(slot)?.sleep_timer())
    }

    pub fn set_sleep_timer(&self, timer: SleepTimer) -> SedResult<()> {
        self.submit("write sleep timer", move |slot| {
            configure(slot)?.set_sleep_timer(timer)
        })
    }

    pub fn led(&self) -> SedResult<bool> {
        self.submit("read LED", |slot| configure(slot)?.led())
    }

    pub fn set_led(&self, on: bool) -> SedResult<()> {
        self.submit("write LED", move |slot| configure(slot)?.set_led(on))
    }

    pub fn virtual_cd(&self) -> SedResult<bool> {
        self.submit("read virtual CD", |slot| configure(slot)?.virtual_cd())
    }

    pub fn set_virtual_cd(&self, enabled: bool) -> SedResult<()> {
        self.submit("write virtual CD", move |slot| {
            configure(slot)?.set_virtual_cd(enabled)
        })
    }

    pub fn basic_diagnose(&self) -> SedResult<DiagnosticReport> {
        self.submit("diagnose", |slot| configure(slot)?.basic_diagnose())
    }

    pub fn erase(&self, options: EraseOptions) -> SedResult<SecurityStatus> {
        self.submit("erase", move |slot| configure(slot)?.erase(options))
    }
}

impl<T: DriveTransport> Drop for DeviceController<T> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("controller worker panicked");
            }
        }
    }
}

/// Publish the worker's binding for `current_device`.
fn mirror<T: DriveTransport>(bound: &Mutex<Option<PathBuf>>, slot: &SessionSlot<T>) {
    *bound.lock().unwrap_or_else(PoisonError::into_inner) =
        slot.current_device().map(Path::to_path_buf);
}

fn credentials<T: DriveTransport>(
    slot: &mut SessionSlot<T>,
    overrides: CredentialOverrides,
) -> SedResult<CredentialService<'_, T::Handle>> {
    let (session, settings) = slot.session_with_settings()?;
    Ok(CredentialService::new(session, settings.default_kdf).with_overrides(overrides))
}

fn configure<T: DriveTransport>(
    slot: &mut SessionSlot<T>,
) -> SedResult<ConfigurationService<'_, T::Handle>> {
    let (session, settings) = slot.session_with_settings()?;
    Ok(ConfigurationService::new(
        session,
        settings.default_kdf,
        settings.discard_after_erase,
    ))
}

/// After a caller gave up on a running request, refresh the session's view of the drive.
fn reverify<T: DriveTransport>(slot: &mut SessionSlot<T>) {
    if let Ok(session) = slot.session() {
        match session.security_status() {
            Ok(status) => info!(
                "re-verified {} after abandoned request: {status}",
                session.drive().path.display()
            ),
            Err(err) => warn!("re-verification after abandoned request failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDrive, SimHandle, SimulatedTransport};
    use crate::status::PostSetupState;
    use crate::transport::{DeviceHandle, DeviceProfile, DeviceRequest, DeviceResponse};
    use std::sync::Barrier;

    fn controller(sim: &SimulatedTransport) -> DeviceController<SimulatedTransport> {
        DeviceController::new(
            sim.clone(),
            SessionSettings::default(),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn two_drive_session_scenario() {
        let sim = SimulatedTransport::new()
            .with_drive(SimDrive::new("/dev/a", "SSD1").post_setup(PostSetupState::Locked))
            .with_drive(SimDrive::new("/dev/b", ""));
        let ctl = controller(&sim);

        let drives = ctl.list_drives().unwrap();
        assert_eq!(
            drives,
            vec![
                Drive {
                    path: "/dev/a".into(),
                    name: "SSD1".into()
                },
                Drive {
                    path: "/dev/b".into(),
                    name: "".into()
                },
            ]
        );
        assert_eq!(ctl.current_device(), None);

        ctl.open_device("/dev/b").unwrap();
        assert_eq!(ctl.current_device(), Some(PathBuf::from("/dev/b")));
        assert!(sim.is_open("/dev/b"));

        ctl.open_device("/dev/a").unwrap();
        assert_eq!(ctl.current_device(), Some(PathBuf::from("/dev/a")));
        assert!(!sim.is_open("/dev/b"));

        ctl.set_password("p1", "h1").unwrap();
        assert_eq!(ctl.security_status().unwrap(), SecurityStatus::Locked);
        assert_eq!(ctl.password_hint().unwrap(), "h1");
        assert_eq!(ctl.unlock("p1").unwrap(), SecurityStatus::Unlocked);
    }

    #[test]
    fn operations_without_a_device_fail_cleanly() {
        let sim = SimulatedTransport::new().with_drive(SimDrive::new("/dev/a", ""));
        let ctl = controller(&sim);
        assert!(matches!(ctl.security_status(), Err(SedError::NoDeviceBound)));
        assert!(matches!(ctl.unlock("pw"), Err(SedError::NoDeviceBound)));
        assert!(matches!(ctl.device_info(), Err(SedError::NoDeviceBound)));
    }

    #[test]
    fn failed_open_keeps_current_device() {
        let sim = SimulatedTransport::new().with_drive(SimDrive::new("/dev/a", ""));
        let ctl = controller(&sim);
        ctl.open_device("/dev/a").unwrap();
        assert!(matches!(
            ctl.open_device("/dev/typo"),
            Err(SedError::DeviceNotFound(_))
        ));
        assert_eq!(ctl.current_device(), Some(PathBuf::from("/dev/a")));
        assert!(sim.is_open("/dev/a"));
        assert_eq!(ctl.security_status().unwrap(), SecurityStatus::NoUserPassword);
    }

    #[test]
    fn close_and_drop_release_the_drive() {
        let sim = SimulatedTransport::new().with_drive(SimDrive::new("/dev/a", ""));
        let ctl = controller(&sim);
        ctl.open_device("/dev/a").unwrap();
        let closed = ctl.close_device().unwrap().unwrap();
        assert_eq!(closed.path, PathBuf::from("/dev/a"));
        assert_eq!(ctl.current_device(), None);

        ctl.open_device("/dev/a").unwrap();
        drop(ctl);
        assert!(!sim.is_open("/dev/a"));
    }

    #[test]
    fn concurrent_callers_are_serialized() {
        let sim = SimulatedTransport::new().with_drive(SimDrive::new("/dev/a", ""));
        let ctl = Arc::new(controller(&sim));
        ctl.open_device("/dev/a").unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let ctl = Arc::clone(&ctl);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ctl.set_led(i % 2 == 0).unwrap();
                    ctl.led().unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(ctl.current_device(), Some(PathBuf::from("/dev/a")));
    }

    #[test]
    fn recovery_overrides_flow_through_the_controller() {
        let sim = SimulatedTransport::new().with_drive(SimDrive::new("/dev/a", ""));
        let ctl = controller(&sim);
        ctl.open_device("/dev/a").unwrap();
        let custom = KdfOverride::parse(Some("xy"), Some(3)).unwrap();
        ctl.set_password_with("pw", "", custom).unwrap();

        let info = ctl.device_info().unwrap();
        assert!(info.kdf_stored);
        assert_eq!(info.kdf.iterations, 3);

        let blob = ctl.password_blob("pw", KdfOverride::default()).unwrap();
        sim.power_cycle("/dev/a");
        assert_eq!(ctl.unlock_with_blob(&blob).unwrap(), SecurityStatus::Unlocked);
    }

    /// Wraps the simulator and stalls one request kind (or `open`).
    #[derive(Clone)]
    struct SlowTransport {
        inner: SimulatedTransport,
        slow: &'static str,
        delay: Duration,
    }

    struct SlowHandle {
        inner: SimHandle,
        slow: &'static str,
        delay: Duration,
    }

    impl DeviceHandle for SlowHandle {
        fn path(&self) -> &Path {
            self.inner.path()
        }

        fn profile(&self) -> DeviceProfile {
            self.inner.profile()
        }

        fn execute(&mut self, request: &DeviceRequest) -> SedResult<DeviceResponse> {
            if request.kind() == self.slow {
                thread::sleep(self.delay);
            }
            self.inner.execute(request)
        }
    }

    impl DriveTransport for SlowTransport {
        type Handle = SlowHandle;

        fn enumerate(&self) -> SedResult<Vec<Drive>> {
            self.inner.enumerate()
        }

        fn open(&self, path: &Path) -> SedResult<SlowHandle> {
            if self.slow == "open" {
                thread::sleep(self.delay);
            }
            Ok(SlowHandle {
                inner: self.inner.open(path)?,
                slow: self.slow,
                delay: self.delay,
            })
        }
    }

    fn slow_controller(
        sim: &SimulatedTransport,
        slow: &'static str,
        timeout_ms: u64,
    ) -> DeviceController<SlowTransport> {
        DeviceController::new(
            SlowTransport {
                inner: sim.clone(),
                slow,
                delay: Duration::from_millis(300),
            },
            SessionSettings::default(),
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    #[test]
    fn abandoned_unlock_is_not_reported_as_success() {
        let sim = SimulatedTransport::new().with_drive(
            SimDrive::new("/dev/a", "").post_setup(PostSetupState::Locked),
        );
        let ctl = slow_controller(&sim, "unlock", 100);
        ctl.open_device("/dev/a").unwrap();
        ctl.set_password("right", "").unwrap();

        assert!(matches!(ctl.unlock("right"), Err(SedError::Cancelled(_))));
        thread::sleep(Duration::from_millis(400));

        // the running request finished on the drive; its outcome is read live
        assert_eq!(sim.request_count("/dev/a", "unlock"), 1);
        assert_eq!(ctl.security_status().unwrap(), SecurityStatus::Unlocked);
    }

    #[test]
    fn queued_erase_is_withdrawn_when_its_caller_times_out() {
        let sim = SimulatedTransport::new().with_drive(SimDrive::new("/dev/a", ""));
        let ctl = Arc::new(slow_controller(&sim, "send_diagnostic", 100));
        ctl.open_device("/dev/a").unwrap();
        ctl.set_password("pw", "").unwrap();

        let diagnosing = {
            let ctl = Arc::clone(&ctl);
            thread::spawn(move || ctl.basic_diagnose())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            ctl.erase(EraseOptions::default()),
            Err(SedError::Cancelled(_))
        ));
        assert!(matches!(
            diagnosing.join().unwrap(),
            Err(SedError::Cancelled(_))
        ));

        thread::sleep(Duration::from_millis(400));
        assert_eq!(sim.request_count("/dev/a", "reset_data_key"), 0);
        assert_eq!(ctl.security_status().unwrap(), SecurityStatus::Unlocked);
        assert_eq!(ctl.password_hint().unwrap(), "");
    }

    #[test]
    fn timed_out_open_still_mirrors_the_worker_binding() {
        let sim = SimulatedTransport::new().with_drive(SimDrive::new("/dev/a", ""));
        let ctl = slow_controller(&sim, "open", 50);

        assert!(matches!(
            ctl.open_device("/dev/a"),
            Err(SedError::Cancelled(_))
        ));
        thread::sleep(Duration::from_millis(400));

        assert!(sim.is_open("/dev/a"));
        assert_eq!(ctl.current_device(), Some(PathBuf::from("/dev/a")));
        assert_eq!(ctl.security_status().unwrap(), SecurityStatus::NoUserPassword);
    }
}
