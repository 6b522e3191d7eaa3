//! The 256-bit profile key.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of a profile key in bytes (256 bits)
pub const PROFILE_KEY_SIZE: usize = 32;

/// Symmetric key that decrypts a user's profile
///
/// Zeroized when dropped. `Debug` prints only a short fingerprint.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct ProfileKey([u8; PROFILE_KEY_SIZE]);

impl ProfileKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; PROFILE_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; PROFILE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PROFILE_KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::InvalidKey(format!(
                "profile key must be {} bytes, got {}",
                PROFILE_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; PROFILE_KEY_SIZE] {
        &self.0
    }

    /// Short hex fingerprint, safe to log
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProfileKey({}…)", self.fingerprint())
    }
}
