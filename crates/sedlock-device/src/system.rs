//! System-backed `DriveTransport`. Drives are discovered through sysfs and
//! every vendor request is forwarded to an external helper that owns the
//! pass-through wire encoding: one JSON request on stdin, one JSON reply on
//! stdout.

use crate::command::{CommandRunner, Output};
use crate::lock::DeviceLock;
use crate::sysfs::scan_block_devices;
use log::{debug, warn};
use regex::Regex;
use sedlock_core::config::SedlockConfig;
use sedlock_core::error::{SedError, SedResult};
use sedlock_core::transport::{
    DeviceHandle, DeviceProfile, DeviceRequest, DeviceResponse, Drive, DriveTransport,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default locations searched for the vendor command helper.
pub const DEFAULT_HELPER_PATHS: &[&str] = &[
    "/usr/libexec/sedlock/sedlock-helper",
    "/usr/local/libexec/sedlock/sedlock-helper",
    "/usr/lib/sedlock/sedlock-helper",
    "/usr/local/bin/sedlock-helper",
];

#[derive(Debug, Clone)]
pub struct SystemTransport {
    runner: CommandRunner,
    sysfs_root: PathBuf,
    pattern: Regex,
    lock_dir: PathBuf,
    profile: DeviceProfile,
}

impl SystemTransport {
    /// Build a transport from the user configuration, discovering the helper when unset.
    pub fn from_config(config: &SedlockConfig) -> SedResult<Self> {
        let timeout = config.transport_timeout();
        let runner = match config.helper_binary_path() {
            Some(path) => Self::runner_with_path(path, timeout)?,
            None => Self::discover_helper(timeout)?,
        };
        debug!("using helper {}", runner.binary().display());
        let pattern = Regex::new(&config.transport.device_pattern).map_err(|err| {
            SedError::InvalidConfig(format!("transport.device_pattern: {err}"))
        })?;

        Ok(Self {
            runner,
            sysfs_root: PathBuf::from(&config.transport.sysfs_root),
            pattern,
            lock_dir: config.lock_dir(),
            profile: config.device_profile(),
        })
    }

    fn runner_with_path(path: PathBuf, timeout: Duration) -> SedResult<CommandRunner> {
        if !path.exists() {
            return Err(SedError::InvalidConfig(format!(
                "helper not found at {}",
                path.display()
            )));
        }
        Ok(CommandRunner::new(path, timeout))
    }

    fn discover_helper(timeout: Duration) -> SedResult<CommandRunner> {
        DEFAULT_HELPER_PATHS
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.exists())
            .map(|found| CommandRunner::new(found.to_path_buf(), timeout))
            .ok_or_else(|| {
                SedError::InvalidConfig(format!(
                    "unable to locate sedlock-helper; tried {:?}",
                    DEFAULT_HELPER_PATHS
                ))
            })
    }
}

impl DriveTransport for SystemTransport {
    type Handle = HelperHandle;

    fn enumerate(&self) -> SedResult<Vec<Drive>> {
        scan_block_devices(&self.sysfs_root, &self.pattern)
    }

    fn open(&self, path: &Path) -> SedResult<HelperHandle> {
        let lock = DeviceLock::acquire(&self.lock_dir, path)?;
        Ok(HelperHandle {
            path: path.to_path_buf(),
            runner: self.runner.clone(),
            profile: self.profile,
            _lock: lock,
        })
    }
}

/// A drive held through its lock file; requests go through the helper.
#[derive(Debug)]
pub struct HelperHandle {
    path: PathBuf,
    runner: CommandRunner,
    profile: DeviceProfile,
    _lock: DeviceLock,
}

impl DeviceHandle for HelperHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn profile(&self) -> DeviceProfile {
        self.profile
    }

    fn execute(&mut self, request: &DeviceRequest) -> SedResult<DeviceResponse> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| SedError::Transport(format!("encode {}: {err}", request.kind())))?;
        let device = self.path.to_string_lossy().into_owned();
        let out = self.runner.run(&["--device", device.as_str()], Some(&payload))?;
        decode_reply(&self.path, request.kind(), &out)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HelperReply {
    Ok(DeviceResponse),
    Error(HelperFault),
}

#[derive(Debug, Deserialize)]
struct HelperFault {
    kind: String,
    #[serde(default)]
    message: String,
}

/// Interpret the helper's stdout, falling back to its exit status and stderr.
fn decode_reply(device: &Path, kind: &str, out: &Output) -> SedResult<DeviceResponse> {
    let stdout = out.stdout.trim();
    match serde_json::from_str::<HelperReply>(stdout) {
        Ok(HelperReply::Ok(response)) => {
            if out.status != 0 {
                warn!("helper returned a reply for {kind} but exited with {}", out.status);
            }
            Ok(response)
        }
        Ok(HelperReply::Error(fault)) => {
            debug!("helper reported {} for {kind}", fault.kind);
            Err(classify_fault(device, fault))
        }
        Err(err) => {
            let stderr = out.stderr.trim();
            if out.status != 0 {
                let lower = stderr.to_ascii_lowercase();
                if lower.contains("no such device") || lower.contains("no such file") {
                    return Err(SedError::DeviceNotFound(device.to_path_buf()));
                }
                return Err(SedError::Transport(format!(
                    "helper exited with code {} during {kind}: {}",
                    out.status,
                    if stderr.is_empty() {
                        "no additional output"
                    } else {
                        stderr
                    }
                )));
            }
            Err(SedError::Transport(format!(
                "unreadable helper reply to {kind}: {err}"
            )))
        }
    }
}

fn classify_fault(device: &Path, fault: HelperFault) -> SedError {
    match fault.kind.as_str() {
        "wrong_password" => SedError::WrongPassword,
        "attempts_exceeded" => SedError::AttemptsExceeded,
        "not_encryption_capable" => SedError::NotEncryptionCapable,
        "busy" => SedError::DeviceBusy {
            path: device.to_path_buf(),
            reason: fault.message,
        },
        "not_found" => SedError::DeviceNotFound(device.to_path_buf()),
        other => SedError::Transport(if fault.message.is_empty() {
            format!("drive reported {other}")
        } else {
            format!("drive reported {other}: {}", fault.message)
        }),
    }
}
