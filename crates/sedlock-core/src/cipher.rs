use crate::error::{SedError, SedResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Data encryption ciphers a drive may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cipher {
    #[serde(rename = "no-encryption")]
    NoEncryption,
    #[serde(rename = "aes-128-ecb")]
    Aes128Ecb,
    #[serde(rename = "aes-128-cbc")]
    Aes128Cbc,
    #[serde(rename = "aes-128-xts")]
    Aes128Xts,
    #[serde(rename = "aes-256-ecb")]
    Aes256Ecb,
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    #[serde(rename = "aes-256-xts")]
    Aes256Xts,
    #[serde(rename = "full-disc-encryption")]
    FullDiscEncryption,
    #[serde(rename = "unknown")]
    Unknown,
}

const NAMES: &[(Cipher, &str)] = &[
    (Cipher::NoEncryption, "no-encryption"),
    (Cipher::Aes128Ecb, "aes-128-ecb"),
    (Cipher::Aes128Cbc, "aes-128-cbc"),
    (Cipher::Aes128Xts, "aes-128-xts"),
    (Cipher::Aes256Ecb, "aes-256-ecb"),
    (Cipher::Aes256Cbc, "aes-256-cbc"),
    (Cipher::Aes256Xts, "aes-256-xts"),
    (Cipher::FullDiscEncryption, "full-disc-encryption"),
    (Cipher::Unknown, "unknown"),
];

impl Cipher {
    pub fn is_encrypting(self) -> bool {
        !matches!(self, Cipher::NoEncryption)
    }

    /// Length of the password blob the firmware expects for this cipher.
    pub fn password_blob_len(self) -> SedResult<usize> {
        match self {
            Cipher::Aes128Ecb | Cipher::Aes128Cbc | Cipher::Aes128Xts => Ok(16),
            Cipher::Aes256Ecb
            | Cipher::Aes256Cbc
            | Cipher::Aes256Xts
            | Cipher::FullDiscEncryption => Ok(32),
            Cipher::NoEncryption => Err(SedError::NotEncryptionCapable),
            Cipher::Unknown => Err(SedError::Transport(
                "drive reports an unsupported cipher".into(),
            )),
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = NAMES
            .iter()
            .find(|(c, _)| c == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown");
        f.write_str(label)
    }
}

impl FromStr for Cipher {
    type Err = SedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        NAMES
            .iter()
            .find(|(_, name)| *name == wanted)
            .map(|(c, _)| *c)
            .ok_or_else(|| SedError::InvalidArgument(format!("unknown cipher `{s}`")))
    }
}
