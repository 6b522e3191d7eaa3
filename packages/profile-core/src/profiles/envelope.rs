//! # Profile Envelope
//!
//! The encrypted profile payload exchanged with the network collaborator.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        PROFILE ENVELOPE (bincode)                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  version            u8                                                  │
//! │  name_ciphertext    Option<bytes>   AES-GCM(padded given \0 family)     │
//! │  username           Option<string>  plaintext                           │
//! │  avatar_url_path    Option<string>  plaintext                           │
//! │  avatar_ciphertext  Option<bytes>   AES-GCM(avatar)                     │
//! │  uuid_capable       bool                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::crypto::{self, ProfileKey};
use crate::error::{Error, Result};

/// Current envelope version
pub const ENVELOPE_VERSION: u8 = 1;

/// Wire form of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileEnvelope {
    /// Format version
    pub version: u8,
    /// Encrypted, padded name
    pub name_ciphertext: Option<Vec<u8>>,
    /// Username
    pub username: Option<String>,
    /// Server path of the encrypted avatar
    pub avatar_url_path: Option<String>,
    /// Encrypted avatar bytes
    pub avatar_ciphertext: Option<Vec<u8>>,
    /// Whether the user's clients support UUID addressing
    pub uuid_capable: bool,
}

/// Decrypted contents of an envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenedProfile {
    /// Given name
    pub given_name: Option<String>,
    /// Family name
    pub family_name: Option<String>,
    /// Username
    pub username: Option<String>,
    /// Avatar path
    pub avatar_url_path: Option<String>,
    /// Avatar bytes, if the envelope carried them
    pub avatar: Option<Vec<u8>>,
    /// UUID capability
    pub uuid_capable: bool,
}

impl ProfileEnvelope {
    /// Encrypt a profile under `key`
    pub fn seal(key: &ProfileKey, profile: &OpenedProfile) -> Result<Self> {
        let has_name = profile.given_name.is_some() || profile.family_name.is_some();
        let name_ciphertext = if has_name {
            Some(crypto::encrypt_name(
                key,
                profile.given_name.as_deref(),
                profile.family_name.as_deref(),
            )?)
        } else {
            None
        };

        if profile.avatar.is_some() && profile.avatar_url_path.is_none() {
            return Err(Error::InvalidProfile(
                "avatar data without an avatar url".into(),
            ));
        }
        let avatar_ciphertext = profile
            .avatar
            .as_deref()
            .map(|avatar| crypto::encrypt_avatar(key, avatar))
            .transpose()?;

        Ok(Self {
            version: ENVELOPE_VERSION,
            name_ciphertext,
            username: profile.username.clone(),
            avatar_url_path: profile.avatar_url_path.clone(),
            avatar_ciphertext,
            uuid_capable: profile.uuid_capable,
        })
    }

    /// Whether opening needs a profile key
    pub fn is_encrypted(&self) -> bool {
        self.name_ciphertext.is_some() || self.avatar_ciphertext.is_some()
    }

    /// Decrypt with the stored key, if any
    ///
    /// ## Errors
    ///
    /// `DecryptFailure` if the envelope is encrypted and no key is known,
    /// the key is wrong, or the envelope is malformed.
    pub fn open(&self, key: Option<&ProfileKey>) -> Result<OpenedProfile> {
        if self.version != ENVELOPE_VERSION {
            return Err(Error::DecryptFailure(format!(
                "unsupported envelope version {}",
                self.version
            )));
        }
        if self.avatar_ciphertext.is_some() && self.avatar_url_path.is_none() {
            return Err(Error::DecryptFailure(
                "avatar ciphertext without an avatar url".into(),
            ));
        }

        let key = match (key, self.is_encrypted()) {
            (Some(key), _) => Some(key),
            (None, false) => None,
            (None, true) => {
                return Err(Error::DecryptFailure(
                    "profile is encrypted but no profile key is known".into(),
                ))
            }
        };

        let (given_name, family_name) = match (&self.name_ciphertext, key) {
            (Some(ciphertext), Some(key)) => crypto::decrypt_name(key, ciphertext)?,
            _ => (None, None),
        };
        let avatar = match (&self.avatar_ciphertext, key) {
            (Some(ciphertext), Some(key)) => Some(crypto::decrypt_avatar(key, ciphertext)?),
            _ => None,
        };

        Ok(OpenedProfile {
            given_name,
            family_name,
            username: self.username.clone(),
            avatar_url_path: self.avatar_url_path.clone(),
            avatar,
            uuid_capable: self.uuid_capable,
        })
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    ///
    /// Undecodable payloads are reported as `DecryptFailure`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::DecryptFailure(format!("malformed profile envelope: {}", e)))
    }
}
