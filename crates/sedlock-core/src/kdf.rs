//! Password → blob derivation understood by the drive firmware.

use crate::error::{SedError, SedResult};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 8;

/// Salt/iteration pair stored alongside the hint on the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub salt: [u8; SALT_LEN],
    pub iterations: u32,
}

impl KdfParams {
    /// Build parameters from a salt string of at most four UTF-16 units.
    pub fn from_salt_text(text: &str, iterations: u32) -> SedResult<Self> {
        let encoded = utf16_le(text);
        if encoded.len() > SALT_LEN {
            return Err(SedError::InvalidArgument(format!(
                "salt `{text}` is longer than {} UTF-16 units",
                SALT_LEN / 2
            )));
        }
        let mut salt = [0u8; SALT_LEN];
        salt[..encoded.len()].copy_from_slice(&encoded);
        Ok(Self { salt, iterations })
    }

    /// Salt rendered as text when it decodes cleanly as UTF-16.
    pub fn salt_text(&self) -> Option<String> {
        let units: Vec<u16> = self
            .salt
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16(&units).ok()?;
        Some(text.trim_end_matches('\0').to_string())
    }
}

/// Operator-supplied replacements for a drive's stored salt or iteration count.
///
/// Needed to reach a drive that was keyed with non-default parameters and
/// has since lost its security block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KdfOverride {
    pub salt: Option<[u8; SALT_LEN]>,
    pub iterations: Option<u32>,
}

impl KdfOverride {
    pub fn parse(salt: Option<&str>, iterations: Option<u32>) -> SedResult<Self> {
        let salt = salt
            .map(|text| KdfParams::from_salt_text(text, 0).map(|params| params.salt))
            .transpose()?;
        Ok(Self { salt, iterations })
    }

    pub fn is_empty(&self) -> bool {
        self.salt.is_none() && self.iterations.is_none()
    }

    pub fn apply(&self, base: KdfParams) -> KdfParams {
        KdfParams {
            salt: self.salt.unwrap_or(base.salt),
            iterations: self.iterations.unwrap_or(base.iterations),
        }
    }
}

/// Hash `salt ‖ UTF-16LE(password)` `iterations` times with SHA-256 and cut
/// the digest down to `blob_len` bytes.
pub fn derive_blob(
    blob_len: usize,
    params: &KdfParams,
    password: &str,
) -> SedResult<Zeroizing<Vec<u8>>> {
    if password.is_empty() {
        return Err(SedError::EmptyPassword);
    }

    let mut blob = Zeroizing::new(params.salt.to_vec());
    blob.extend_from_slice(&Zeroizing::new(utf16_le(password)));
    for _ in 0..params.iterations {
        let digest = Sha256::digest(blob.as_slice());
        blob.clear();
        blob.extend_from_slice(&digest);
    }
    blob.truncate(blob_len);
    Ok(blob)
}

pub(crate) fn utf16_le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_params() -> KdfParams {
        KdfParams::from_salt_text("WDC.", 1000).unwrap()
    }

    #[test]
    fn default_salt_matches_firmware_bytes() {
        assert_eq!(default_params().salt, [87, 0, 68, 0, 67, 0, 46, 0]);
    }

    #[test]
    fn salt_text_longer_than_four_units_is_rejected() {
        assert!(matches!(
            KdfParams::from_salt_text("toolong", 1),
            Err(SedError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_iterations_is_plain_concatenation() {
        let params = KdfParams {
            salt: [1; SALT_LEN],
            iterations: 0,
        };
        let blob = derive_blob(16, &params, "ab").unwrap();
        assert_eq!(&blob[..], &[1, 1, 1, 1, 1, 1, 1, 1, b'a', 0, b'b', 0][..]);
    }

    #[test]
    fn single_iteration_is_sha256_of_input() {
        let params = KdfParams {
            salt: [0; SALT_LEN],
            iterations: 1,
        };
        let blob = derive_blob(32, &params, "pw").unwrap();
        let mut input = vec![0u8; SALT_LEN];
        input.extend_from_slice(&[b'p', 0, b'w', 0]);
        assert_eq!(&blob[..], Sha256::digest(&input).as_slice());
    }

    #[test]
    fn blob_is_truncated_to_cipher_width() {
        let blob = derive_blob(16, &default_params(), "secret").unwrap();
        assert_eq!(blob.len(), 16);
        let wide = derive_blob(32, &default_params(), "secret").unwrap();
        assert_eq!(&wide[..16], &blob[..]);
    }

    #[test]
    fn overrides_replace_only_what_is_given() {
        let iterations_only = KdfOverride::parse(None, Some(42)).unwrap();
        let params = iterations_only.apply(default_params());
        assert_eq!(params.salt, default_params().salt);
        assert_eq!(params.iterations, 42);

        let salt_only = KdfOverride::parse(Some("ab"), None).unwrap();
        let params = salt_only.apply(default_params());
        assert_eq!(params.salt, [b'a', 0, b'b', 0, 0, 0, 0, 0]);
        assert_eq!(params.iterations, 1000);
        assert_eq!(params.salt_text().as_deref(), Some("ab"));

        assert!(KdfOverride::default().is_empty());
        assert!(KdfOverride::parse(Some("toolong"), None).is_err());
    }

    #[test]
    fn empty_password_is_rejected() {
        assert!(matches!(
            derive_blob(32, &default_params(), ""),
            Err(SedError::EmptyPassword)
        ));
    }
}
