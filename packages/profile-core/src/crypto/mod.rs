//! # Cryptography Module
//!
//! Profile bodies are encrypted under a per-user 256-bit profile key that
//! the owner hands out to the peers and groups in their profile whitelist.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PROFILE ENCRYPTION                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ProfileKey (32 random bytes, owned by the profile's user)              │
//! │         │                                                               │
//! │         ├──► AES-256-GCM( pad(given \0 family) ) ──► name ciphertext    │
//! │         │                                                               │
//! │         └──► AES-256-GCM( avatar bytes )        ──► avatar ciphertext   │
//! │                                                                         │
//! │  Ciphertext layout:  nonce (12) || ciphertext || tag (16)               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Key agreement and transport encryption are not handled here.

mod encryption;
mod profile_key;

pub use encryption::{
    decrypt_avatar, decrypt_name, encrypt_avatar, encrypt_name, open, seal, NONCE_SIZE,
    NAME_PADDED_LENGTHS, TAG_SIZE,
};
pub use profile_key::{ProfileKey, PROFILE_KEY_SIZE};
