//! Drive configuration: sleep timer, LED, virtual CD, self-test and erase.

use crate::cipher::Cipher;
use crate::error::{SedError, SedResult};
use crate::kdf::KdfParams;
use crate::metadata::{SecurityBlock, SECURITY_BLOCK_INDEX};
use crate::report::{event, DeviceInfo, DiagnosticReport, ReportLevel};
use crate::session::DeviceSession;
use crate::status::{Operation, SecurityStatus};
use crate::transport::{DeviceHandle, DeviceRequest, DeviceResponse, SelfTestOutcome};
use log::{debug, error, info, warn};
use std::fmt;
use std::str::FromStr;

const LED_ON: u8 = 255;
const LED_OFF: u8 = 0;
const MIN_DEVICE_SECONDS: u32 = 60;

/// Standby timeout in whole minutes; zero disables standby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SleepTimer(u32);

impl SleepTimer {
    pub const DISABLED: SleepTimer = SleepTimer(0);
    /// The firmware caps standby at eight hours.
    pub const MAX_MINUTES: u32 = 480;

    pub fn from_minutes(minutes: i64) -> SedResult<Self> {
        if minutes < 0 {
            return Err(SedError::InvalidArgument(format!(
                "sleep timer must not be negative (got {minutes})"
            )));
        }
        if minutes > i64::from(Self::MAX_MINUTES) {
            return Err(SedError::InvalidArgument(format!(
                "sleep timer of {minutes} minutes exceeds {}",
                Self::MAX_MINUTES
            )));
        }
        Ok(SleepTimer(minutes as u32))
    }

    /// Interpret the firmware's value, rounding partial minutes up.
    pub fn from_device_seconds(seconds: u32) -> Self {
        SleepTimer(seconds.div_ceil(60).min(Self::MAX_MINUTES))
    }

    pub fn minutes(self) -> u32 {
        self.0
    }

    pub fn is_disabled(self) -> bool {
        self.0 == 0
    }

    pub fn device_seconds(self) -> u32 {
        if self.0 == 0 {
            0
        } else {
            (self.0 * 60).max(MIN_DEVICE_SECONDS)
        }
    }
}

impl FromStr for SleepTimer {
    type Err = SedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let minutes: i64 = s.trim().parse().map_err(|_| {
            SedError::InvalidArgument(format!("sleep timer `{s}` is not a whole number of minutes"))
        })?;
        Self::from_minutes(minutes)
    }
}

impl fmt::Display for SleepTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_disabled() {
            f.write_str("disabled")
        } else {
            write!(f, "{} min", self.0)
        }
    }
}

/// Knobs for [`ConfigurationService::erase`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EraseOptions {
    /// Cipher for the new data key; the drive's current cipher when unset.
    pub cipher: Option<Cipher>,
    /// Override the configured discard behaviour.
    pub discard_blocks: Option<bool>,
}

pub struct ConfigurationService<'a, H: DeviceHandle> {
    session: &'a mut DeviceSession<H>,
    defaults: KdfParams,
    discard_after_erase: bool,
}

impl<'a, H: DeviceHandle> ConfigurationService<'a, H> {
    pub fn new(
        session: &'a mut DeviceSession<H>,
        defaults: KdfParams,
        discard_after_erase: bool,
    ) -> Self {
        Self {
            session,
            defaults,
            discard_after_erase,
        }
    }

    pub fn sleep_timer(&mut self) -> SedResult<SleepTimer> {
        let seconds = self
            .session
            .execute(&DeviceRequest::ReadSleepTimer)?
            .into_seconds()?;
        Ok(SleepTimer::from_device_seconds(seconds))
    }

    pub fn set_sleep_timer(&mut self, timer: SleepTimer) -> SedResult<()> {
        self.session
            .execute(&DeviceRequest::WriteSleepTimer {
                seconds: timer.device_seconds(),
            })?
            .done()?;
        info!("sleep timer on {} set to {timer}", self.path());
        Ok(())
    }

    pub fn led(&mut self) -> SedResult<bool> {
        let level = self
            .session
            .execute(&DeviceRequest::ReadLedBrightness)?
            .into_brightness()?;
        Ok(level != LED_OFF)
    }

    /// Switch the activity LED; a no-op when it is already in that state.
    pub fn set_led(&mut self, on: bool) -> SedResult<()> {
        self.session.security_status()?.require(Operation::WriteToggle)?;
        if self.led()? == on {
            debug!("LED on {} already {}", self.path(), on_off(on));
            return Ok(());
        }
        self.session
            .execute(&DeviceRequest::WriteLedBrightness {
                level: if on { LED_ON } else { LED_OFF },
            })?
            .done()?;
        info!("LED on {} switched {}", self.path(), on_off(on));
        Ok(())
    }

    pub fn virtual_cd(&mut self) -> SedResult<bool> {
        self.session
            .execute(&DeviceRequest::ReadVirtualCd)?
            .into_switch()
    }

    /// Show or hide the emulated CD; a no-op when already in that state.
    pub fn set_virtual_cd(&mut self, enabled: bool) -> SedResult<()> {
        self.session.security_status()?.require(Operation::WriteToggle)?;
        if self.virtual_cd()? == enabled {
            debug!("virtual CD on {} already {}", self.path(), on_off(enabled));
            return Ok(());
        }
        self.session
            .execute(&DeviceRequest::WriteVirtualCd { enabled })?
            .done()?;
        info!("virtual CD on {} switched {}", self.path(), on_off(enabled));
        Ok(())
    }

    /// Product, cipher and key-derivation facts in one read-only pass.
    pub fn info(&mut self) -> SedResult<DeviceInfo> {
        let (status, report) = self.session.snapshot()?;
        let product = self
            .session
            .execute(&DeviceRequest::ProductIdentification)?
            .into_product()?;
        let raw = self
            .session
            .execute(&DeviceRequest::ReadHandyStore {
                index: SECURITY_BLOCK_INDEX,
            })?
            .into_block()?;
        let block = SecurityBlock::decode(&raw);

        Ok(DeviceInfo {
            drive: self.session.drive().clone(),
            product: product.trim().to_string(),
            status,
            blob_len: report.blob_len().ok(),
            cipher: report.cipher,
            supported_ciphers: report.supported_ciphers,
            kdf_stored: block.is_some(),
            kdf: block.as_ref().map_or(self.defaults, |block| block.kdf),
            hint: block.map(|block| block.hint).unwrap_or_default(),
        })
    }

    /// Run the built-in self-test. A hardware fault is a report, not an error.
    pub fn basic_diagnose(&mut self) -> SedResult<DiagnosticReport> {
        let mut events = Vec::new();

        match self
            .session
            .execute(&DeviceRequest::ProductIdentification)
            .and_then(DeviceResponse::into_product)
        {
            Ok(product) => events.push(event(
                ReportLevel::Info,
                format!("Product: {}", product.trim()),
            )),
            Err(err) => events.push(event(
                ReportLevel::Warn,
                format!("Product identification unavailable: {err}"),
            )),
        }

        match self.session.security_status() {
            Ok(status) => events.push(event(
                ReportLevel::Security,
                format!("Security status: {status}"),
            )),
            Err(err) => events.push(event(
                ReportLevel::Warn,
                format!("Security status unavailable: {err}"),
            )),
        }

        let outcome = self
            .session
            .execute(&DeviceRequest::SendDiagnostic)?
            .into_self_test()?;
        match outcome {
            SelfTestOutcome::Passed => {
                events.push(event(ReportLevel::Success, "Self-test passed"));
            }
            SelfTestOutcome::HardwareError => {
                warn!("{} failed its self-test", self.path());
                events.push(event(
                    ReportLevel::Error,
                    "Self-test reported a hardware error",
                ));
            }
        }

        Ok(DiagnosticReport {
            drive: self.session.drive().clone(),
            outcome,
            events,
        })
    }

    /// Destroy the data key, leaving the drive without a user password.
    pub fn erase(&mut self, options: EraseOptions) -> SedResult<SecurityStatus> {
        let (status, report) = self.session.snapshot()?;
        status.require(Operation::Erase)?;

        let cipher = options.cipher.unwrap_or(report.cipher);
        if !report.supported_ciphers.contains(&cipher) {
            return Err(SedError::InvalidArgument(format!(
                "cipher {cipher} is not supported by {}",
                self.path()
            )));
        }

        info!("erasing {} (was {status}) with {cipher}", self.path());
        let reset = self
            .session
            .execute(&DeviceRequest::ResetDataKey {
                cipher,
                key_reset_enabler: report.key_reset_enabler,
            })
            .and_then(DeviceResponse::done);
        if let Err(err) = reset {
            let observed = self.session.security_status().ok();
            error!("erase of {} interrupted: {err}", self.path());
            return Err(SedError::EraseInterrupted {
                reason: err.to_string(),
                observed,
            });
        }
        self.session.attempts_mut().reset();

        self.reset_security_block();
        if options.discard_blocks.unwrap_or(self.discard_after_erase) {
            match self
                .session
                .execute(&DeviceRequest::DiscardAll)
                .and_then(DeviceResponse::done)
            {
                Ok(()) => debug!("discarded all blocks on {}", self.path()),
                Err(err) => warn!("discard after erase failed on {}: {err}", self.path()),
            }
        }

        let after = self.session.security_status()?;
        let expected = status.after(Operation::Erase, self.session.profile().post_setup_state);
        if after != expected {
            warn!("{} reports {after} after erase; expected {expected}", self.path());
        }
        Ok(after)
    }

    fn reset_security_block(&mut self) {
        let written = SecurityBlock::new(self.defaults, "")
            .and_then(|block| block.encode())
            .and_then(|data| {
                self.session.execute(&DeviceRequest::WriteHandyStore {
                    index: SECURITY_BLOCK_INDEX,
                    data,
                })
            })
            .and_then(DeviceResponse::done);
        if let Err(err) = written {
            warn!("could not reset security block on {}: {err}", self.path());
        }
    }

    fn path(&self) -> String {
        self.session.drive().path.display().to_string()
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
