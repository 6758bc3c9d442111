use crate::error::{SedError, SedResult};
use crate::kdf::KdfParams;
use crate::status::PostSetupState;
use crate::transport::DeviceProfile;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransportCfg {
    /// Vendor command helper; discovered from the default search path when unset.
    #[serde(default)]
    pub helper_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,

    /// Regular expression block device names must match to be listed.
    #[serde(default = "default_device_pattern")]
    pub device_pattern: String,

    /// Case-insensitive substring the product identification must contain.
    #[serde(default)]
    pub product_filter: Option<String>,

    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_sysfs_root() -> String {
    "/sys/block".to_string()
}

fn default_device_pattern() -> String {
    "^sd[a-z]+$".to_string()
}

fn default_lock_dir() -> String {
    "/run/sedlock".to_string()
}

impl Default for TransportCfg {
    fn default() -> Self {
        Self {
            helper_path: None,
            timeout_secs: default_timeout_secs(),
            sysfs_root: default_sysfs_root(),
            device_pattern: default_device_pattern(),
            product_filter: None,
            lock_dir: default_lock_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeviceCfg {
    #[serde(default = "default_unlock_attempt_limit")]
    pub unlock_attempt_limit: u32,

    #[serde(default)]
    pub post_setup_state: PostSetupState,
}

fn default_unlock_attempt_limit() -> u32 {
    5
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            unlock_attempt_limit: default_unlock_attempt_limit(),
            post_setup_state: PostSetupState::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KdfCfg {
    /// Salt used when the drive carries no security block (max four characters).
    #[serde(default = "default_salt")]
    pub default_salt: String,

    #[serde(default = "default_iterations")]
    pub default_iterations: u32,
}

fn default_salt() -> String {
    "WDC.".to_string()
}

fn default_iterations() -> u32 {
    1000
}

impl Default for KdfCfg {
    fn default() -> Self {
        Self {
            default_salt: default_salt(),
            default_iterations: default_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EraseCfg {
    /// Discard every logical block after the data key is reset.
    #[serde(default = "default_discard_blocks")]
    pub discard_blocks: bool,
}

fn default_discard_blocks() -> bool {
    true
}

impl Default for EraseCfg {
    fn default() -> Self {
        Self {
            discard_blocks: default_discard_blocks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ControllerCfg {
    /// How long a caller waits for a queued request before giving up on it.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ControllerCfg {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SedlockConfig {
    #[serde(default)]
    pub transport: TransportCfg,

    #[serde(default)]
    pub device: DeviceCfg,

    #[serde(default)]
    pub kdf: KdfCfg,

    #[serde(default)]
    pub erase: EraseCfg,

    #[serde(default)]
    pub controller: ControllerCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

impl SedlockConfig {
    /// Read and validate a configuration file; the first issue is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> SedResult<Self> {
        let cfg = Self::parse(path)?;
        if let Some(issue) = cfg.validate().into_iter().next() {
            return Err(SedError::InvalidConfig(issue));
        }
        Ok(cfg)
    }

    /// Read a configuration file without validating its values.
    pub fn parse<P: AsRef<Path>>(path: P) -> SedResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"));
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };
        Ok(cfg)
    }

    /// Collect every problem with the configuration instead of stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.transport.timeout_secs == 0 {
            issues.push("transport.timeout_secs must be greater than zero".to_string());
        }
        if self.transport.device_pattern.trim().is_empty() {
            issues.push("transport.device_pattern must not be empty".to_string());
        }
        if self.device.unlock_attempt_limit == 0 {
            issues.push("device.unlock_attempt_limit must be at least 1".to_string());
        }
        if let Err(err) = self.default_kdf() {
            issues.push(format!("kdf.default_salt: {err}"));
        }
        if self.kdf.default_iterations == 0 {
            issues.push("kdf.default_iterations must be at least 1".to_string());
        }
        if self.controller.request_timeout_secs == 0 {
            issues.push("controller.request_timeout_secs must be greater than zero".to_string());
        }

        issues
    }

    pub fn default_kdf(&self) -> SedResult<KdfParams> {
        KdfParams::from_salt_text(&self.kdf.default_salt, self.kdf.default_iterations)
    }

    pub fn device_profile(&self) -> DeviceProfile {
        DeviceProfile {
            unlock_attempt_limit: self.device.unlock_attempt_limit,
            post_setup_state: self.device.post_setup_state,
        }
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.request_timeout_secs)
    }

    pub fn helper_binary_path(&self) -> Option<PathBuf> {
        self.transport.helper_path.as_ref().map(PathBuf::from)
    }

    pub fn lock_dir(&self) -> PathBuf {
        PathBuf::from(&self.transport.lock_dir)
    }
}
