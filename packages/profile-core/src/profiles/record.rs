//! Profile records and sparse patches.

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::crypto::ProfileKey;
use crate::error::{Error, Result};

/// Maximum avatar size in bytes (5 MiB)
pub const MAX_AVATAR_SIZE: usize = 5 * 1024 * 1024;

/// Maximum length of a single name component in bytes
pub const MAX_NAME_LENGTH: usize = 128;

/// A user's stored profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    /// Whose profile this is
    pub address: Address,
    /// Key the profile is encrypted under
    pub profile_key: Option<ProfileKey>,
    /// Decrypted given name
    pub given_name: Option<String>,
    /// Decrypted family name
    pub family_name: Option<String>,
    /// Username, if the user registered one
    pub username: Option<String>,
    /// Server path of the encrypted avatar
    pub avatar_url_path: Option<String>,
    /// Decrypted avatar bytes
    pub avatar_blob: Option<Vec<u8>>,
    /// Whether the peer advertises UUID support
    pub is_uuid_capable: bool,
    /// Unix millis of the last successful fetch
    pub last_fetch_at: Option<i64>,
    /// Unix millis of the last fetch attempt
    pub last_fetch_attempt_at: Option<i64>,
    /// Unix millis the record was created
    pub created_at: i64,
    /// Unix millis the record last changed
    pub updated_at: i64,
}

impl ProfileRecord {
    /// An empty record for a newly observed address
    pub fn new(address: Address, now: i64) -> Self {
        Self {
            address,
            profile_key: None,
            given_name: None,
            family_name: None,
            username: None,
            avatar_url_path: None,
            avatar_blob: None,
            is_uuid_capable: false,
            last_fetch_at: None,
            last_fetch_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Given and family name joined by a space and trimmed
    ///
    /// `None` when the result would be empty.
    pub fn full_name(&self) -> Option<String> {
        let joined = [self.given_name.as_deref(), self.family_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        let trimmed = joined.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Whether a given or family name is set
    pub fn has_name(&self) -> bool {
        self.full_name().is_some()
    }

    /// Whether an avatar is set
    pub fn has_avatar(&self) -> bool {
        self.avatar_url_path.is_some() || self.avatar_blob.is_some()
    }

    /// The avatar as an image, if its format is recognized
    pub fn avatar_image(&self) -> Option<AvatarImage> {
        self.avatar_blob
            .as_ref()
            .and_then(|data| AvatarImage::from_bytes(data.clone()).ok())
    }

    /// Check the record's own invariants
    pub fn validate(&self) -> Result<()> {
        if self.avatar_blob.is_some() && self.avatar_url_path.is_none() {
            return Err(Error::InvalidProfile(
                "avatar data without an avatar url".into(),
            ));
        }
        if let Some(ref blob) = self.avatar_blob {
            if blob.len() > MAX_AVATAR_SIZE {
                return Err(Error::InvalidProfile(format!(
                    "avatar is {} bytes, max {}",
                    blob.len(),
                    MAX_AVATAR_SIZE
                )));
            }
        }
        for name in [&self.given_name, &self.family_name].into_iter().flatten() {
            if name.len() > MAX_NAME_LENGTH {
                return Err(Error::InvalidProfile(format!(
                    "name is {} bytes, max {}",
                    name.len(),
                    MAX_NAME_LENGTH
                )));
            }
            if name.contains('\0') {
                return Err(Error::InvalidProfile("name contains a NUL byte".into()));
            }
        }
        Ok(())
    }

    /// Field-by-field comparison, ignoring `created_at` and `updated_at`
    pub(crate) fn same_contents(&self, other: &ProfileRecord) -> bool {
        self.address.uuid() == other.address.uuid()
            && self.address.phone_number() == other.address.phone_number()
            && self.profile_key == other.profile_key
            && self.given_name == other.given_name
            && self.family_name == other.family_name
            && self.username == other.username
            && self.avatar_url_path == other.avatar_url_path
            && self.avatar_blob == other.avatar_blob
            && self.is_uuid_capable == other.is_uuid_capable
            && self.last_fetch_at == other.last_fetch_at
            && self.last_fetch_attempt_at == other.last_fetch_attempt_at
    }

    /// Fill every empty field from `other`
    ///
    /// Used when one record absorbs another; fields already set here win.
    pub(crate) fn absorb(&mut self, other: &ProfileRecord) {
        fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
            if slot.is_none() {
                *slot = from.clone();
            }
        }

        fill(&mut self.profile_key, &other.profile_key);
        fill(&mut self.given_name, &other.given_name);
        fill(&mut self.family_name, &other.family_name);
        fill(&mut self.username, &other.username);
        if self.avatar_url_path.is_none() {
            self.avatar_url_path = other.avatar_url_path.clone();
            self.avatar_blob = other.avatar_blob.clone();
        }
        fill(&mut self.last_fetch_at, &other.last_fetch_at);
        fill(&mut self.last_fetch_attempt_at, &other.last_fetch_attempt_at);
        self.is_uuid_capable |= other.is_uuid_capable;
        self.created_at = self.created_at.min(other.created_at);
    }
}

/// Sparse update to a [`ProfileRecord`]
///
/// `None` leaves a field alone, `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    /// New profile key
    pub profile_key: Option<Option<ProfileKey>>,
    /// New given name
    pub given_name: Option<Option<String>>,
    /// New family name
    pub family_name: Option<Option<String>>,
    /// New username
    pub username: Option<Option<String>>,
    /// New avatar URL path
    pub avatar_url_path: Option<Option<String>>,
    /// New avatar bytes
    pub avatar_blob: Option<Option<Vec<u8>>>,
    /// UUID capability; once true it stays true
    pub is_uuid_capable: Option<bool>,
    /// New last successful fetch time
    pub last_fetch_at: Option<Option<i64>>,
    /// New last fetch attempt time
    pub last_fetch_attempt_at: Option<Option<i64>>,
}

impl ProfilePatch {
    /// An empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the profile key
    pub fn profile_key(mut self, key: Option<ProfileKey>) -> Self {
        self.profile_key = Some(key);
        self
    }

    /// Set both name components
    pub fn name(mut self, given_name: Option<String>, family_name: Option<String>) -> Self {
        self.given_name = Some(given_name);
        self.family_name = Some(family_name);
        self
    }

    /// Set the username
    pub fn username(mut self, username: Option<String>) -> Self {
        self.username = Some(username);
        self
    }

    /// Set the avatar path and bytes together
    pub fn avatar(mut self, url_path: Option<String>, blob: Option<Vec<u8>>) -> Self {
        self.avatar_url_path = Some(url_path);
        self.avatar_blob = Some(blob);
        self
    }

    /// Set the avatar path only
    pub fn avatar_url_path(mut self, url_path: Option<String>) -> Self {
        self.avatar_url_path = Some(url_path);
        self
    }

    /// Mark the peer UUID capable
    pub fn uuid_capable(mut self, capable: bool) -> Self {
        self.is_uuid_capable = Some(capable);
        self
    }

    /// Record a successful fetch
    pub fn fetched_at(mut self, at: i64) -> Self {
        self.last_fetch_at = Some(Some(at));
        self.last_fetch_attempt_at = Some(Some(at));
        self
    }

    /// Record a fetch attempt
    pub fn attempted_at(mut self, at: i64) -> Self {
        self.last_fetch_attempt_at = Some(Some(at));
        self
    }

    /// Whether the patch changes nothing
    pub fn is_empty(&self) -> bool {
        self.profile_key.is_none()
            && self.given_name.is_none()
            && self.family_name.is_none()
            && self.username.is_none()
            && self.avatar_url_path.is_none()
            && self.avatar_blob.is_none()
            && self.is_uuid_capable.is_none()
            && self.last_fetch_at.is_none()
            && self.last_fetch_attempt_at.is_none()
    }

    /// Apply to a record in place
    pub fn apply(&self, record: &mut ProfileRecord) {
        fn set<T: Clone>(slot: &mut Option<T>, value: &Option<Option<T>>) {
            if let Some(value) = value {
                *slot = value.clone();
            }
        }

        set(&mut record.profile_key, &self.profile_key);
        set(&mut record.given_name, &self.given_name);
        set(&mut record.family_name, &self.family_name);
        set(&mut record.username, &self.username);
        set(&mut record.avatar_url_path, &self.avatar_url_path);
        set(&mut record.avatar_blob, &self.avatar_blob);
        if let Some(capable) = self.is_uuid_capable {
            record.is_uuid_capable |= capable;
        }
        set(&mut record.last_fetch_at, &self.last_fetch_at);
        set(&mut record.last_fetch_attempt_at, &self.last_fetch_attempt_at);
    }
}

/// Avatar image formats recognized by their magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    /// PNG
    Png,
    /// JPEG
    Jpeg,
    /// GIF
    Gif,
    /// WebP
    WebP,
}

impl ImageFormat {
    /// Detect the format from the leading bytes
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(ImageFormat::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Some(ImageFormat::WebP)
        } else {
            None
        }
    }

    /// MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::WebP => "image/webp",
        }
    }
}

/// Avatar bytes with a known image format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarImage {
    format: ImageFormat,
    data: Vec<u8>,
}

impl AvatarImage {
    /// Wrap avatar bytes, rejecting unknown formats and oversized images
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_AVATAR_SIZE {
            return Err(Error::InvalidProfile(format!(
                "avatar is {} bytes, max {}",
                data.len(),
                MAX_AVATAR_SIZE
            )));
        }
        let format = ImageFormat::sniff(&data)
            .ok_or_else(|| Error::InvalidProfile("unrecognized avatar format".into()))?;
        Ok(Self { format, data })
    }

    /// Image format
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Raw bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the raw bytes
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
