//! # Profile Cipher
//!
//! AES-256-GCM under the profile key, with a random nonce per ciphertext.
//!
//! ## Name Padding
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  "Ada" + "Lovelace"                                                     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  b"Ada\0Lovelace"                                 (12 bytes)            │
//! │        │                                                                │
//! │        ▼  zero-pad to the smallest bucket that fits                     │
//! │  b"Ada\0Lovelace\0\0\0 ... \0"                    (53 bytes)            │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  nonce || AES-256-GCM(key, nonce, padded) || tag  (81 bytes)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Padding keeps ciphertext length from revealing the name length beyond
//! its bucket.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;

use super::ProfileKey;
use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Plaintext lengths a padded name may have
pub const NAME_PADDED_LENGTHS: [usize; 2] = [53, 257];

/// Separator between given and family name
const NAME_SEPARATOR: u8 = 0;

/// Encrypt bytes under a profile key
///
/// Returns `nonce || ciphertext_with_tag`.
pub fn seal(key: &ProfileKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext_with_tag` under a profile key
///
/// ## Errors
///
/// Returns `DecryptFailure` if the input is too short, was tampered with,
/// or was sealed under a different key.
pub fn open(key: &ProfileKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::DecryptFailure(format!(
            "ciphertext too short: {} bytes",
            sealed.len()
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::DecryptFailure(format!("Invalid key: {}", e)))?;

    cipher
        .decrypt(AesNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::DecryptFailure("authentication tag mismatch".into()))
}

/// Pad and encrypt a profile name
pub fn encrypt_name(
    key: &ProfileKey,
    given_name: Option<&str>,
    family_name: Option<&str>,
) -> Result<Vec<u8>> {
    let mut joined = Vec::new();
    joined.extend_from_slice(given_name.unwrap_or_default().as_bytes());
    if let Some(family) = family_name {
        joined.push(NAME_SEPARATOR);
        joined.extend_from_slice(family.as_bytes());
    }

    let padded_len = NAME_PADDED_LENGTHS
        .iter()
        .copied()
        .find(|len| *len >= joined.len())
        .ok_or_else(|| {
            Error::InvalidProfile(format!(
                "profile name too long: {} bytes, max {}",
                joined.len(),
                NAME_PADDED_LENGTHS[NAME_PADDED_LENGTHS.len() - 1]
            ))
        })?;
    joined.resize(padded_len, 0);

    seal(key, &joined)
}

/// Decrypt and unpad a profile name into `(given, family)`
///
/// Empty components come back as `None`.
pub fn decrypt_name(
    key: &ProfileKey,
    ciphertext: &[u8],
) -> Result<(Option<String>, Option<String>)> {
    let padded = open(key, ciphertext)?;

    let end = padded
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    let unpadded = &padded[..end];

    let (given, family) = match unpadded.iter().position(|b| *b == NAME_SEPARATOR) {
        Some(i) => (&unpadded[..i], Some(&unpadded[i + 1..])),
        None => (unpadded, None),
    };

    let decode = |bytes: &[u8]| -> Result<Option<String>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| Error::DecryptFailure("profile name is not UTF-8".into()))
    };

    Ok((decode(given)?, family.map(decode).transpose()?.flatten()))
}

/// Encrypt avatar bytes
pub fn encrypt_avatar(key: &ProfileKey, avatar: &[u8]) -> Result<Vec<u8>> {
    seal(key, avatar)
}

/// Decrypt avatar bytes
pub fn decrypt_avatar(key: &ProfileKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    open(key, ciphertext)
}

// ============================================================================
// TESTS
// ============================================================================
