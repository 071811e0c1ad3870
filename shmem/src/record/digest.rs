use std::fmt;
use std::str;

use crate::errors::{Result, ShmemLibError};

/// Length of a hex-encoded 32-byte digest.
pub const HEX_DIGEST_LEN: usize = 64;

/// A 32-byte digest kept as exactly 64 lowercase ASCII hex characters.
///
/// The bytes are copied verbatim in and out of shared memory, so there is no
/// terminator and no trailing garbage: either all 64 bytes are hex, or all 64
/// are zero (the "unset" value a freshly created segment starts with, and what
/// the daemon gives us for seed hashes on pre-RandomX blocks).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HexDigest([u8; HEX_DIGEST_LEN]);

impl HexDigest {
    pub const UNSET: HexDigest = HexDigest([0; HEX_DIGEST_LEN]);

    pub fn from_hex(s: &str) -> Result<HexDigest> {
        if s.len() != HEX_DIGEST_LEN {
            return Err(ShmemLibError::InvalidDigest(format!(
                "expected {} hex characters, got {}",
                HEX_DIGEST_LEN,
                s.len()
            )));
        }
        let mut raw = [0u8; HEX_DIGEST_LEN / 2];
        hex::decode_to_slice(s, &mut raw)
            .map_err(|e| ShmemLibError::InvalidDigest(format!("{}: {}", s, e)))?;
        Ok(HexDigest::from_digest(&raw))
    }

    pub fn from_digest(digest: &[u8; HEX_DIGEST_LEN / 2]) -> HexDigest {
        let mut buf = [0u8; HEX_DIGEST_LEN];
        // Output is exactly twice the input, this cannot fail.
        let _ = hex::encode_to_slice(digest, &mut buf);
        HexDigest(buf)
    }

    pub fn to_digest(&self) -> Result<[u8; HEX_DIGEST_LEN / 2]> {
        let mut raw = [0u8; HEX_DIGEST_LEN / 2];
        hex::decode_to_slice(self.0, &mut raw)
            .map_err(|e| ShmemLibError::InvalidDigest(e.to_string()))?;
        Ok(raw)
    }

    pub fn is_unset(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; HEX_DIGEST_LEN] {
        &self.0
    }

    /// `None` when unset.
    pub fn as_str(&self) -> Option<&str> {
        if self.is_unset() {
            return None;
        }
        str::from_utf8(&self.0).ok()
    }
}

impl Default for HexDigest {
    fn default() -> Self {
        HexDigest::UNSET
    }
}

impl fmt::Display for HexDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => f.write_str("<unset>"),
        }
    }
}

impl fmt::Debug for HexDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexDigest({})", self)
    }
}
