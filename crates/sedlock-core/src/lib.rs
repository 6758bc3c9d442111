pub mod cipher;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod kdf;
pub mod logging;
pub mod metadata;
pub mod report;
pub mod session;
pub mod settings;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod status;
pub mod transport;

pub use cipher::Cipher;
pub use config::{ConfigFormat, SedlockConfig};
pub use controller::DeviceController;
pub use credentials::{CredentialOverrides, CredentialService};
pub use error::{Disposition, SedError, SedResult};
pub use kdf::{KdfOverride, KdfParams};
pub use report::{DeviceInfo, DiagnosticReport, ReportEvent, ReportLevel};
pub use session::{DeviceSession, SessionSettings, SessionSlot};
pub use settings::{ConfigurationService, EraseOptions, SleepTimer};
pub use status::{AttemptTracker, Operation, PostSetupState, SecurityStatus};
pub use transport::{
    DeviceHandle, DeviceProfile, DeviceRequest, DeviceResponse, Drive, DriveTransport,
    EncryptionReport, SelfTestOutcome,
};
