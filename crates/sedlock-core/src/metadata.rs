//! Security block stored in the drive's handy store: the password hint plus
//! the salt and iteration count the password blob was derived with.

use crate::error::{SedError, SedResult};
use crate::kdf::{utf16_le, KdfParams, SALT_LEN};
use log::warn;

pub const HANDY_STORE_BLOCK_SIZE: usize = 512;
pub const SECURITY_BLOCK_INDEX: u32 = 1;
/// Hint capacity in UTF-16 units, terminator included.
pub const HINT_CAPACITY: usize = 101;

const SIGNATURE: [u8; 4] = [0x00, 0x01, b'D', b'W'];
const ITERATIONS_AT: usize = 8;
const SALT_AT: usize = 12;
const HINT_AT: usize = 24;
const CHECKSUM_AT: usize = HANDY_STORE_BLOCK_SIZE - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
    pub kdf: KdfParams,
    pub hint: String,
}

impl SecurityBlock {
    pub fn new(kdf: KdfParams, hint: impl Into<String>) -> SedResult<Self> {
        let hint = hint.into();
        validate_hint(&hint)?;
        Ok(Self { kdf, hint })
    }

    /// Parse a raw block; `None` when the block was never written or is corrupt.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != HANDY_STORE_BLOCK_SIZE {
            warn!(
                "security block has {} bytes, expected {HANDY_STORE_BLOCK_SIZE}",
                raw.len()
            );
            return None;
        }
        if raw[..SIGNATURE.len()] != SIGNATURE {
            return None;
        }
        let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            warn!("security block checksum mismatch; ignoring stored hint");
            return None;
        }

        let iterations = u32::from_le_bytes(
            raw[ITERATIONS_AT..ITERATIONS_AT + 4]
                .try_into()
                .ok()?,
        );
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&raw[SALT_AT..SALT_AT + SALT_LEN]);

        let units: Vec<u16> = raw[HINT_AT..HINT_AT + HINT_CAPACITY * 2]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|unit| *unit != 0)
            .collect();
        let hint = match String::from_utf16(&units) {
            Ok(hint) => hint.trim().to_string(),
            Err(err) => {
                warn!("security block hint is not valid UTF-16: {err}");
                String::new()
            }
        };

        Some(Self {
            kdf: KdfParams { salt, iterations },
            hint,
        })
    }

    pub fn encode(&self) -> SedResult<Vec<u8>> {
        validate_hint(&self.hint)?;
        let mut raw = vec![0u8; HANDY_STORE_BLOCK_SIZE];
        raw[..SIGNATURE.len()].copy_from_slice(&SIGNATURE);
        raw[ITERATIONS_AT..ITERATIONS_AT + 4].copy_from_slice(&self.kdf.iterations.to_le_bytes());
        raw[SALT_AT..SALT_AT + SALT_LEN].copy_from_slice(&self.kdf.salt);
        let hint = utf16_le(&self.hint);
        raw[HINT_AT..HINT_AT + hint.len()].copy_from_slice(&hint);

        let sum = raw.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        raw[CHECKSUM_AT] = 0u8.wrapping_sub(sum);
        Ok(raw)
    }
}

pub fn validate_hint(hint: &str) -> SedResult<()> {
    let units = hint.encode_utf16().count();
    if units >= HINT_CAPACITY {
        return Err(SedError::InvalidArgument(format!(
            "hint is {units} UTF-16 units long; at most {} allowed",
            HINT_CAPACITY - 1
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KdfParams {
        KdfParams::from_salt_text("WDC.", 1000).unwrap()
    }

    #[test]
    fn encoded_block_sums_to_zero() {
        let block = SecurityBlock::new(params(), "my cat").unwrap();
        let raw = block.encode().unwrap();
        assert_eq!(raw.len(), HANDY_STORE_BLOCK_SIZE);
        assert_eq!(raw.iter().fold(0u8, |a, b| a.wrapping_add(*b)), 0);
        assert_eq!(&raw[..4], &SIGNATURE);
        assert_eq!(&raw[8..12], &1000u32.to_le_bytes());
    }

    #[test]
    fn decode_reads_back_hint_and_params() {
        let block = SecurityBlock::new(params(), "  grüße  ").unwrap();
        let decoded = SecurityBlock::decode(&block.encode().unwrap()).unwrap();
        assert_eq!(decoded.kdf, params());
        assert_eq!(decoded.hint, "grüße");
    }

    #[test]
    fn blank_store_has_no_block() {
        assert!(SecurityBlock::decode(&[0u8; HANDY_STORE_BLOCK_SIZE]).is_none());
    }

    #[test]
    fn corrupted_checksum_is_ignored() {
        let mut raw = SecurityBlock::new(params(), "hint").unwrap().encode().unwrap();
        raw[100] ^= 0xff;
        assert!(SecurityBlock::decode(&raw).is_none());
    }

    #[test]
    fn hint_capacity_is_enforced() {
        let longest = "x".repeat(HINT_CAPACITY - 1);
        assert!(SecurityBlock::new(params(), longest).is_ok());
        let too_long = "x".repeat(HINT_CAPACITY);
        assert!(matches!(
            SecurityBlock::new(params(), too_long),
            Err(SedError::InvalidArgument(_))
        ));
    }
}
