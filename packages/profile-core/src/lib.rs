//! # Profile Core
//!
//! Local store, sharing policy and fetch coordination for the user profiles
//! of an end-to-end encrypted messaging client.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        PROFILE CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │                      ┌──────────────────────┐                           │
//! │                      │    ProfileManager    │ ◄── ProfileService        │
//! │                      └──────────┬───────────┘                           │
//! │          ┌──────────────────────┼──────────────────────┐                │
//! │          ▼                      ▼                      ▼                │
//! │  ┌───────────────┐    ┌──────────────────┐    ┌────────────────┐        │
//! │  │  Whitelist    │    │ FetchCoordinator │    │    SyncHub     │        │
//! │  │               │    │                  │    │                │        │
//! │  │ - Users       │    │ - Dedup          │    │ - Outbound     │        │
//! │  │ - Groups      │    │ - Cooldown       │    │ - Echo ledger  │        │
//! │  │ - Threads     │    │ - Back-off       │    │                │        │
//! │  └───────┬───────┘    └────────┬─────────┘    └────────────────┘        │
//! │          │                     │                                        │
//! │          ▼                     ▼                                        │
//! │  ┌───────────────────────────────────────┐    ┌────────────────┐        │
//! │  │            ProfileStore               │    │    Crypto      │        │
//! │  │  - Merge on write   - ReadCache (LRU) │◄──►│ - AES-256-GCM  │        │
//! │  └───────────────────┬───────────────────┘    │ - ProfileKey   │        │
//! │                      ▼                        └────────────────┘        │
//! │  ┌───────────────────────────────────────┐                              │
//! │  │       Storage (SQLite, rusqlite)      │                              │
//! │  └───────────────────────────────────────┘                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`address`] - Peer addresses (UUID and/or E.164 phone number)
//! - [`config`] - Configuration and defaults
//! - [`crypto`] - Profile keys and profile encryption
//! - [`error`] - Error types for the entire library
//! - [`events`] - Notifications back to the owner
//! - [`fetch`] - Remote fetch coordination
//! - [`logging`] - Tracing subscriber setup
//! - [`manager`] - The [`ProfileManager`] facade
//! - [`profiles`] - Records, envelope, store and read cache
//! - [`storage`] - SQLite database and transactions
//! - [`sync`] - Outbound sync stream and echo suppression
//! - [`time`] - Monotonic and wall clocks
//! - [`whitelist`] - Who the local profile is shared with
//!
//! ## Example
//!
//! ```ignore
//! use profile_core::{Address, FetchOptions, ProfileConfig, ProfileManager};
//!
//! let manager = ProfileManager::new(ProfileConfig::from_env(), local, network)?;
//! manager.whitelist_user(&bob)?;
//! let fetched = manager.fetch_profile(&bob, FetchOptions::default()).await?;
//! println!("{:?}", fetched.record.full_name());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod address;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod fetch;
pub mod logging;
pub mod manager;
pub mod profiles;
pub mod storage;
pub mod sync;
pub mod time;
pub mod whitelist;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use address::Address;
pub use config::{CacheConfig, FetchConfig, HostEnvironment, ProfileConfig};
pub use crypto::ProfileKey;
pub use error::{Error, Result};
pub use events::ProfileEvent;
pub use fetch::{
    FetchError, FetchHandle, FetchOptions, FetchPhase, FetchSource, FetchedProfile, ProfileNetwork,
};
pub use manager::{AvatarChange, LocalProfileUpdate, ProfileManager, ProfileService};
pub use profiles::{AvatarImage, ProfilePatch, ProfileRecord};
pub use sync::SyncEvent;
pub use whitelist::{ConversationThread, GroupId, ShareTarget, WhitelistEntry};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of the profile core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
