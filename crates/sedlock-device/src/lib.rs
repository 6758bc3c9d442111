//! System transport for sedlock. Drives are discovered through sysfs; vendor
//! requests go to an external helper process. `command` covers process
//! spawning, `lock` exclusive access, `sysfs` discovery.

mod command;
mod lock;
mod sysfs;
mod system;

pub use system::{HelperHandle, SystemTransport, DEFAULT_HELPER_PATHS};
